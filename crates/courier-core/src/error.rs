use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Attribute key or value rejected by the wire schema.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(&'static str),
    /// Correlation token was empty or contained only whitespace.
    #[error("invalid correlation token")]
    InvalidToken,
}
