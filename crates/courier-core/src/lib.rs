//! Core courier primitives shared across crates.
//!
//! Includes correlation tokens, the message attribute schema, and base errors.

pub mod attributes;
pub mod error;
pub mod token;

pub use attributes::{Attributes, CallAttributes};
pub use error::CoreError;
pub use token::CorrelationToken;
