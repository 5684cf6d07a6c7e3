use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{InboundMessage, OutboundMessage};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport is closed")]
    Closed,
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

/// Subscription to create on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub name: String,
    /// Server-side filter expression; `None` receives every message.
    pub filter: Option<String>,
}

impl SubscriptionSpec {
    pub fn unfiltered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: None,
        }
    }

    pub fn filtered(name: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: Some(filter.into()),
        }
    }
}

type Closer = Box<dyn FnOnce() -> Result<(), TransportError> + Send>;

/// Active pull on a subscription.
///
/// Deliveries made on transport-owned tasks are handed over through a bounded
/// channel; [`Subscription::recv`] is cancel-safe and can sit in `select!`.
pub struct Subscription {
    name: String,
    inbox: mpsc::Receiver<InboundMessage>,
    closer: Option<Closer>,
}

impl Subscription {
    pub fn new(
        name: impl Into<String>,
        inbox: mpsc::Receiver<InboundMessage>,
        closer: impl FnOnce() -> Result<(), TransportError> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inbox,
            closer: Some(Box::new(closer)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next delivery. `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbox.recv().await
    }

    /// Stops the pull and detaches from the transport.
    ///
    /// Deliveries still buffered are dropped unacknowledged, so the transport
    /// redelivers them to the next subscriber.
    pub fn close(mut self) -> Result<(), TransportError> {
        self.inbox.close();
        while self.inbox.try_recv().is_ok() {}
        match self.closer.take() {
            Some(closer) => closer(),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("open", &self.closer.is_some())
            .finish()
    }
}

/// Publish/subscribe contract used by the correlation engine.
///
/// Transports provide at-least-once, unordered delivery. Acknowledgement goes
/// through the [`crate::AckHandle`] attached to every delivery.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publishes one message and returns the transport-assigned message id.
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError>;

    /// Creates a subscription on `topic`.
    ///
    /// Returns [`TransportError::AlreadyExists`] when the name is taken.
    async fn create_subscription(
        &self,
        topic: &str,
        spec: &SubscriptionSpec,
    ) -> Result<(), TransportError>;

    /// Starts pulling from an existing subscription.
    async fn subscribe(
        &self,
        subscription: &str,
        capacity: usize,
    ) -> Result<Subscription, TransportError>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::{Subscription, SubscriptionSpec, TransportError};

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            TransportError::TopicNotFound("t".into()).to_string(),
            "topic not found: t"
        );
        assert_eq!(
            TransportError::AlreadyExists("s".into()).to_string(),
            "already exists: s"
        );
        assert_eq!(TransportError::Closed.to_string(), "transport is closed");
    }

    #[test]
    fn spec_constructors_set_filter() {
        assert_eq!(SubscriptionSpec::unfiltered("a").filter, None);
        assert_eq!(
            SubscriptionSpec::filtered("a", "attributes.x = \"1\"").filter,
            Some("attributes.x = \"1\"".to_string())
        );
    }

    #[test]
    fn close_runs_closer_once() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let (_tx, rx) = mpsc::channel(1);
        let sub = Subscription::new("s", rx, move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
            Ok(())
        });
        assert_eq!(sub.name(), "s");
        sub.close().expect("close");
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn drop_runs_closer() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let (_tx, rx) = mpsc::channel(1);
        drop(Subscription::new("s", rx, move || {
            flag.store(true, Ordering::SeqCst);
            Err(TransportError::Closed)
        }));
        assert!(closed.load(Ordering::SeqCst));
    }
}
