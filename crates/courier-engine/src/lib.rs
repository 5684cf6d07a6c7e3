//! Request/response correlation over a one-way pub/sub transport.
//!
//! An [`Engine`] publishes each call tagged with a fresh correlation token,
//! parks the caller on a waiter, and resolves it when a single listener task
//! sees a reply carrying the same token. In-flight calls are bounded by a
//! concurrency limiter, and stopping the engine fails every outstanding call
//! instead of leaving it suspended.

pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod listener;
pub mod retry;
pub mod router;
pub mod stats;
pub mod waiters;

pub use config::EngineConfig;
pub use engine::{Engine, Reply};
pub use error::{CallError, MalformedMessage, StartError};
pub use retry::RetryPolicy;
pub use router::SubscriptionRouter;
pub use stats::EngineStats;
