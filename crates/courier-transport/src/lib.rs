//! Transport abstractions for courier.
//!
//! The engine only depends on the async publish/subscribe contract defined in
//! this crate. Delivery is assumed to be at-least-once and unordered.

pub mod adapter;
pub mod filter;
pub mod memory;
pub mod message;

pub use adapter::{PubSubTransport, Subscription, SubscriptionSpec, TransportError};
pub use filter::AttributeFilter;
pub use memory::{InMemoryBroker, Responder};
pub use message::{AckHandle, AckSink, InboundMessage, OutboundMessage, ReceivedMessage};
