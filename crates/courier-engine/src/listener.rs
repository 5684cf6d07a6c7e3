//! Single consumption loop over the reply subscription.
//!
//! Every delivery is acknowledged exactly once, whether it resolved a waiter,
//! matched nothing, or was malformed. Unmatched and malformed deliveries are
//! never requeued.

use std::sync::Arc;

use courier_core::CorrelationToken;
use courier_transport::{InboundMessage, Subscription};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::MalformedMessage;
use crate::stats::EngineCounters;
use crate::waiters::WaiterTable;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Resolved,
    Unmatched,
    Malformed(MalformedMessage),
}

fn extract_token(inbound: &InboundMessage) -> Result<CorrelationToken, MalformedMessage> {
    let raw = inbound
        .message
        .request_id()
        .ok_or(MalformedMessage::MissingRequestId)?;
    CorrelationToken::parse(raw).map_err(|_| MalformedMessage::BlankRequestId)
}

/// Correlates one delivery with its waiter and acknowledges it.
pub(crate) fn dispatch(
    waiters: &WaiterTable,
    counters: &EngineCounters,
    inbound: InboundMessage,
) -> Dispatch {
    EngineCounters::bump(&counters.delivered);
    let token = extract_token(&inbound);
    let (message, ack) = inbound.into_parts();

    let outcome = match token {
        Err(reason) => {
            warn!(
                message_id = %message.message_id,
                %reason,
                "dropping malformed reply"
            );
            EngineCounters::bump(&counters.malformed);
            Dispatch::Malformed(reason)
        }
        Ok(token) => {
            let message_id = message.message_id.clone();
            let attempt = message.delivery_attempt;
            if waiters.resolve(&token, message) {
                EngineCounters::bump(&counters.matched);
                Dispatch::Resolved
            } else {
                debug!(
                    request_id = %token,
                    message_id = %message_id,
                    delivery_attempt = attempt,
                    "no waiter for reply; discarding"
                );
                EngineCounters::bump(&counters.unmatched);
                Dispatch::Unmatched
            }
        }
    };
    ack.ack();
    outcome
}

/// Runs until `shutdown` fires or the transport ends the subscription.
///
/// On exit the subscription is closed and the waiter table drained, so no
/// caller is left waiting on a listener that no longer exists. A dropped
/// `shutdown` sender counts as a stop signal. Returns the number of waiters
/// failed by the drain.
pub(crate) async fn run(
    mut subscription: Subscription,
    waiters: Arc<WaiterTable>,
    counters: Arc<EngineCounters>,
    mut shutdown: oneshot::Receiver<()>,
) -> usize {
    info!(subscription = subscription.name(), "listener started");
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!(subscription = subscription.name(), "listener received stop signal");
                break;
            }
            maybe_inbound = subscription.recv() => match maybe_inbound {
                Some(inbound) => {
                    dispatch(&waiters, &counters, inbound);
                }
                None => {
                    warn!(subscription = subscription.name(), "subscription ended by transport");
                    break;
                }
            },
        }
    }

    let name = subscription.name().to_string();
    if let Err(err) = subscription.close() {
        warn!(subscription = %name, %err, "failed to close subscription");
    }
    let drained = waiters.drain();
    info!(subscription = %name, drained, "listener stopped");
    drained
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use courier_core::{Attributes, CorrelationToken};
    use courier_transport::{
        AckHandle, AckSink, InboundMessage, ReceivedMessage, Subscription, TransportError,
    };
    use tokio::sync::{mpsc, oneshot};

    use super::{dispatch, run, Dispatch};
    use crate::error::{CallError, MalformedMessage};
    use crate::stats::EngineCounters;
    use crate::waiters::WaiterTable;

    #[derive(Default)]
    struct CountingSink {
        acks: AtomicU64,
        nacks: AtomicU64,
    }

    impl AckSink for CountingSink {
        fn ack(&self, _ack_id: u64) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }

        fn nack(&self, _ack_id: u64) {
            self.nacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn inbound(sink: &Arc<CountingSink>, request_id: Option<&str>) -> InboundMessage {
        let mut attributes = Attributes::new();
        if let Some(id) = request_id {
            attributes.insert("request_id".into(), id.into());
        }
        let sink: Arc<dyn AckSink> = sink.clone();
        InboundMessage::new(
            ReceivedMessage {
                message_id: "m-1".into(),
                payload: Bytes::from_static(b"pong"),
                attributes,
                delivery_attempt: 1,
            },
            AckHandle::new(1, sink),
        )
    }

    #[tokio::test]
    async fn matching_reply_resolves_and_acks() {
        let waiters = WaiterTable::new();
        let counters = EngineCounters::default();
        let sink = Arc::new(CountingSink::default());
        let token = CorrelationToken::generate();
        let rx = waiters.insert(token.clone()).expect("insert");

        let outcome = dispatch(&waiters, &counters, inbound(&sink, Some(token.as_str())));
        assert_eq!(outcome, Dispatch::Resolved);
        assert_eq!(sink.acks.load(Ordering::SeqCst), 1);
        let reply = rx.await.expect("slot").expect("success");
        assert_eq!(reply.payload, Bytes::from_static(b"pong"));
    }

    #[test]
    fn duplicate_delivery_is_acked_and_discarded() {
        let waiters = WaiterTable::new();
        let counters = EngineCounters::default();
        let sink = Arc::new(CountingSink::default());
        let token = CorrelationToken::generate();
        let _rx = waiters.insert(token.clone()).expect("insert");

        assert_eq!(
            dispatch(&waiters, &counters, inbound(&sink, Some(token.as_str()))),
            Dispatch::Resolved
        );
        assert_eq!(
            dispatch(&waiters, &counters, inbound(&sink, Some(token.as_str()))),
            Dispatch::Unmatched
        );
        assert_eq!(sink.acks.load(Ordering::SeqCst), 2);
        assert_eq!(sink.nacks.load(Ordering::SeqCst), 0);
        let stats = counters.snapshot(0, 0);
        assert_eq!((stats.matched, stats.unmatched), (1, 1));
    }

    #[test]
    fn malformed_delivery_is_acked_without_touching_waiters() {
        let waiters = WaiterTable::new();
        let counters = EngineCounters::default();
        let sink = Arc::new(CountingSink::default());
        let token = CorrelationToken::generate();
        let _rx = waiters.insert(token.clone()).expect("insert");

        assert_eq!(
            dispatch(&waiters, &counters, inbound(&sink, None)),
            Dispatch::Malformed(MalformedMessage::MissingRequestId)
        );
        assert_eq!(
            dispatch(&waiters, &counters, inbound(&sink, Some("  "))),
            Dispatch::Malformed(MalformedMessage::BlankRequestId)
        );
        assert_eq!(sink.acks.load(Ordering::SeqCst), 2);
        assert!(waiters.contains(&token));
        assert_eq!(counters.snapshot(1, 0).malformed, 2);
    }

    #[tokio::test]
    async fn close_error_still_drains_waiters() {
        let (_inbox_tx, inbox_rx) = mpsc::channel(4);
        let closer_ran = Arc::new(AtomicBool::new(false));
        let subscription = {
            let closer_ran = Arc::clone(&closer_ran);
            Subscription::new("replies", inbox_rx, move || {
                closer_ran.store(true, Ordering::SeqCst);
                Err(TransportError::Closed)
            })
        };
        let waiters = Arc::new(WaiterTable::new());
        let rx = waiters.insert(CorrelationToken::generate()).expect("insert");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let listener = tokio::spawn(run(
            subscription,
            Arc::clone(&waiters),
            Arc::new(EngineCounters::default()),
            shutdown_rx,
        ));
        shutdown_tx.send(()).expect("listener alive");

        assert_eq!(listener.await.expect("listener task"), 1);
        assert!(closer_ran.load(Ordering::SeqCst));
        assert!(waiters.is_closed());
        assert_eq!(rx.await.expect("slot filled"), Err(CallError::EngineStopped));
    }

    #[tokio::test]
    async fn transport_ending_subscription_drains_waiters() {
        let (inbox_tx, inbox_rx) = mpsc::channel(4);
        let subscription = Subscription::new("replies", inbox_rx, || Ok(()));
        let waiters = Arc::new(WaiterTable::new());
        let rx = waiters.insert(CorrelationToken::generate()).expect("insert");
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();

        let listener = tokio::spawn(run(
            subscription,
            Arc::clone(&waiters),
            Arc::new(EngineCounters::default()),
            shutdown_rx,
        ));
        drop(inbox_tx);

        assert_eq!(listener.await.expect("listener task"), 1);
        assert_eq!(rx.await.expect("slot filled"), Err(CallError::EngineStopped));
    }
}
