use std::time::Duration;

use courier_core::CorrelationToken;
use courier_transport::TransportError;
use thiserror::Error;

/// Failure observed by a caller of [`crate::Engine::call`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The outbound send failed at the transport.
    #[error("publish failed: {0}")]
    Publish(#[from] TransportError),
    /// No matching reply arrived before the deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The call was outstanding when the engine stopped, or was issued after.
    #[error("engine stopped")]
    EngineStopped,
    #[error("engine not started")]
    NotStarted,
    /// A waiter already exists for this token. Unreachable with generated
    /// tokens; treated as a programming error.
    #[error("duplicate correlation token: {0}")]
    DuplicateToken(CorrelationToken),
}

impl CallError {
    /// Whether re-issuing the call with a fresh token may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Publish(_) | CallError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine was stopped and cannot be restarted")]
    Stopped,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Inbound delivery the listener could not correlate. Logged and dropped,
/// never surfaced to a caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("message has no request_id attribute")]
    MissingRequestId,
    #[error("message has a blank request_id attribute")]
    BlankRequestId,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::CorrelationToken;
    use courier_transport::TransportError;

    use super::{CallError, MalformedMessage, StartError};

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            CallError::Publish(TransportError::Unavailable("down".into())).to_string(),
            "publish failed: transport unavailable: down"
        );
        assert_eq!(
            CallError::Timeout(Duration::from_millis(50)).to_string(),
            "no reply within 50ms"
        );
        assert_eq!(CallError::EngineStopped.to_string(), "engine stopped");
        assert_eq!(
            CallError::DuplicateToken(CorrelationToken::parse("t").expect("token")).to_string(),
            "duplicate correlation token: t"
        );
        assert_eq!(
            StartError::InvalidConfig("max_concurrent_calls must be positive").to_string(),
            "invalid config: max_concurrent_calls must be positive"
        );
        assert_eq!(
            MalformedMessage::MissingRequestId.to_string(),
            "message has no request_id attribute"
        );
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(CallError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(CallError::Publish(TransportError::Closed).is_retryable());
        assert!(!CallError::EngineStopped.is_retryable());
        assert!(!CallError::NotStarted.is_retryable());
    }
}
