use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use courier_core::attributes::{Attributes, REQUEST_ID};

/// Message handed to [`crate::PubSubTransport::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub attributes: Attributes,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>, attributes: Attributes) -> Self {
        Self {
            payload: payload.into(),
            attributes,
        }
    }
}

/// Receiving side of an acknowledgement.
///
/// Implemented by transports; `nack` asks for redelivery.
pub trait AckSink: Send + Sync {
    fn ack(&self, ack_id: u64);
    fn nack(&self, ack_id: u64);
}

/// One-shot acknowledgement for a delivered message.
///
/// `ack`/`nack` consume the handle, so a delivery cannot be settled twice.
/// Dropping an unsettled handle nacks it.
pub struct AckHandle {
    ack_id: u64,
    sink: Option<Arc<dyn AckSink>>,
}

impl AckHandle {
    pub fn new(ack_id: u64, sink: Arc<dyn AckSink>) -> Self {
        Self {
            ack_id,
            sink: Some(sink),
        }
    }

    /// Handle with nothing behind it, for messages built by hand in tests.
    pub fn detached() -> Self {
        Self {
            ack_id: 0,
            sink: None,
        }
    }

    pub fn ack_id(&self) -> u64 {
        self.ack_id
    }

    pub fn ack(mut self) {
        if let Some(sink) = self.sink.take() {
            sink.ack(self.ack_id);
        }
    }

    pub fn nack(mut self) {
        if let Some(sink) = self.sink.take() {
            sink.nack(self.ack_id);
        }
    }

    /// Drops the handle without settling it.
    pub(crate) fn disarm(mut self) {
        self.sink = None;
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.nack(self.ack_id);
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("ack_id", &self.ack_id)
            .field("settled", &self.sink.is_none())
            .finish()
    }
}

/// Payload and metadata of a delivered message, without its ack handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub payload: Bytes,
    pub attributes: Attributes,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_attempt: u32,
}

impl ReceivedMessage {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.attribute(REQUEST_ID)
    }
}

/// Message delivered by a subscription, carrying its ack handle.
#[derive(Debug)]
pub struct InboundMessage {
    pub message: ReceivedMessage,
    pub ack: AckHandle,
}

impl InboundMessage {
    pub fn new(message: ReceivedMessage, ack: AckHandle) -> Self {
        Self { message, ack }
    }

    pub fn into_parts(self) -> (ReceivedMessage, AckHandle) {
        (self.message, self.ack)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::{AckHandle, AckSink, ReceivedMessage};
    use courier_core::Attributes;

    #[derive(Default)]
    struct CountingSink {
        acks: AtomicU64,
        nacks: AtomicU64,
    }

    impl AckSink for CountingSink {
        fn ack(&self, _ack_id: u64) {
            self.acks.fetch_add(1, Ordering::Relaxed);
        }

        fn nack(&self, _ack_id: u64) {
            self.nacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn ack_settles_once_and_suppresses_drop_nack() {
        let sink = Arc::new(CountingSink::default());
        let handle = AckHandle::new(7, sink.clone());
        assert_eq!(handle.ack_id(), 7);
        handle.ack();
        assert_eq!(sink.acks.load(Ordering::Relaxed), 1);
        assert_eq!(sink.nacks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dropping_unsettled_handle_nacks() {
        let sink = Arc::new(CountingSink::default());
        drop(AckHandle::new(1, sink.clone()));
        assert_eq!(sink.acks.load(Ordering::Relaxed), 0);
        assert_eq!(sink.nacks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn detached_handle_is_inert() {
        AckHandle::detached().ack();
        drop(AckHandle::detached());
    }

    #[test]
    fn request_id_reads_attribute() {
        let mut attributes = Attributes::new();
        attributes.insert("request_id".into(), "abc".into());
        let msg = ReceivedMessage {
            message_id: "1".into(),
            payload: bytes::Bytes::from_static(b"x"),
            attributes,
            delivery_attempt: 1,
        };
        assert_eq!(msg.request_id(), Some("abc"));
        assert_eq!(msg.attribute("missing"), None);
    }
}
