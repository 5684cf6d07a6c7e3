//! In-memory pub/sub broker for tests, demos and simulations.
//!
//! Mirrors the semantics the engine relies on from a hosted broker: named
//! topics fan out to subscriptions, subscriptions may carry an attribute
//! filter, delivery is at-least-once and a nacked (or dropped) delivery is
//! redelivered with an incremented attempt counter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::attributes::{Attributes, REQUEST_ID, SESSION_ID, SHARD_INDEX};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapter::{PubSubTransport, Subscription, SubscriptionSpec, TransportError};
use crate::filter::AttributeFilter;
use crate::message::{AckHandle, AckSink, InboundMessage, OutboundMessage, ReceivedMessage};

/// Per-subscription delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionCounters {
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Deliveries handed out but not yet settled.
    pub outstanding: u64,
    /// Deliveries waiting for a subscriber or for channel capacity.
    pub backlog: u64,
}

#[derive(Debug, Clone)]
struct Delivery {
    message_id: String,
    payload: Bytes,
    attributes: Attributes,
    attempt: u32,
}

struct SubscriptionState {
    topic: String,
    filter: AttributeFilter,
    sender: Option<mpsc::Sender<InboundMessage>>,
    sink: Arc<BrokerAckSink>,
    backlog: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
    counters: SubscriptionCounters,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
    published: HashMap<String, u64>,
    fail_publish: Option<String>,
    duplicate_deliveries: bool,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_message_id: AtomicU64,
    next_ack_id: AtomicU64,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, subscription: &str, ack_id: u64, redeliver: bool) {
        let mut state = self.lock();
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return;
        };
        let Some(mut delivery) = sub.unacked.remove(&ack_id) else {
            return;
        };
        sub.counters.outstanding = sub.counters.outstanding.saturating_sub(1);
        if redeliver {
            sub.counters.nacked += 1;
            delivery.attempt += 1;
            sub.backlog.push_back(delivery);
        } else {
            sub.counters.acked += 1;
        }
        self.flush(sub);
    }

    /// Moves backlog entries into the subscriber channel while it has room.
    fn flush(&self, sub: &mut SubscriptionState) {
        let Some(sender) = sub.sender.clone() else {
            sub.counters.backlog = sub.backlog.len() as u64;
            return;
        };
        while let Some(delivery) = sub.backlog.pop_front() {
            let ack_id = self.next_ack_id.fetch_add(1, Ordering::Relaxed) + 1;
            let sink: Arc<dyn AckSink> = sub.sink.clone();
            let inbound = InboundMessage::new(
                ReceivedMessage {
                    message_id: delivery.message_id.clone(),
                    payload: delivery.payload.clone(),
                    attributes: delivery.attributes.clone(),
                    delivery_attempt: delivery.attempt,
                },
                AckHandle::new(ack_id, sink),
            );
            // Register before sending so a settle racing the send finds it.
            sub.unacked.insert(ack_id, delivery);
            match sender.try_send(inbound) {
                Ok(()) => {
                    sub.counters.delivered += 1;
                    sub.counters.outstanding += 1;
                }
                Err(err) => {
                    let delivery = sub.unacked.remove(&ack_id);
                    // Disarm the rejected handle; its drop would re-enter the lock.
                    let (_, ack) = err.into_inner().into_parts();
                    ack.disarm();
                    if let Some(delivery) = delivery {
                        sub.backlog.push_front(delivery);
                    }
                    if sender.is_closed() {
                        sub.sender = None;
                    }
                    break;
                }
            }
        }
        sub.counters.backlog = sub.backlog.len() as u64;
    }
}

struct BrokerAckSink {
    broker: Weak<BrokerInner>,
    subscription: String,
}

impl AckSink for BrokerAckSink {
    fn ack(&self, ack_id: u64) {
        if let Some(broker) = self.broker.upgrade() {
            broker.settle(&self.subscription, ack_id, false);
        }
    }

    fn nack(&self, ack_id: u64) {
        if let Some(broker) = self.broker.upgrade() {
            broker.settle(&self.subscription, ack_id, true);
        }
    }
}

/// Cloneable handle to a shared in-memory broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a topic. Returns false when it already existed.
    pub fn create_topic(&self, topic: impl Into<String>) -> bool {
        let mut state = self.inner.lock();
        let topic = topic.into();
        if state.topics.contains_key(&topic) {
            return false;
        }
        state.topics.insert(topic, Vec::new());
        true
    }

    /// Makes every publish fail with [`TransportError::Unavailable`].
    pub fn set_fail_publish(&self, reason: Option<String>) {
        self.inner.lock().fail_publish = reason;
    }

    /// Delivers every published message twice to each subscription.
    pub fn set_duplicate_deliveries(&self, duplicate: bool) {
        self.inner.lock().duplicate_deliveries = duplicate;
    }

    pub fn published_count(&self, topic: &str) -> u64 {
        self.inner.lock().published.get(topic).copied().unwrap_or(0)
    }

    pub fn has_subscription(&self, name: &str) -> bool {
        self.inner.lock().subscriptions.contains_key(name)
    }

    /// Rendered filter of a subscription, if it has one.
    pub fn subscription_filter(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .subscriptions
            .get(name)
            .filter(|sub| !sub.filter.is_empty())
            .map(|sub| sub.filter.to_string())
    }

    pub fn subscription_topic(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .subscriptions
            .get(name)
            .map(|sub| sub.topic.clone())
    }

    /// Whether a subscriber is currently pulling from `name`.
    pub fn is_attached(&self, name: &str) -> bool {
        self.inner
            .lock()
            .subscriptions
            .get(name)
            .and_then(|sub| sub.sender.as_ref())
            .is_some_and(|sender| !sender.is_closed())
    }

    pub fn counters(&self, name: &str) -> Option<SubscriptionCounters> {
        self.inner
            .lock()
            .subscriptions
            .get(name)
            .map(|sub| sub.counters)
    }
}

#[async_trait]
impl PubSubTransport for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        let mut state = self.inner.lock();
        if let Some(reason) = &state.fail_publish {
            return Err(TransportError::Unavailable(reason.clone()));
        }
        let Some(subscriptions) = state.topics.get(topic).cloned() else {
            return Err(TransportError::TopicNotFound(topic.to_string()));
        };
        let message_id = (self.inner.next_message_id.fetch_add(1, Ordering::Relaxed) + 1)
            .to_string();
        let copies = if state.duplicate_deliveries { 2 } else { 1 };
        *state.published.entry(topic.to_string()).or_default() += 1;

        for name in subscriptions {
            let Some(sub) = state.subscriptions.get_mut(&name) else {
                continue;
            };
            if !sub.filter.matches(&message.attributes) {
                continue;
            }
            for _ in 0..copies {
                sub.backlog.push_back(Delivery {
                    message_id: message_id.clone(),
                    payload: message.payload.clone(),
                    attributes: message.attributes.clone(),
                    attempt: 1,
                });
            }
            self.inner.flush(sub);
        }
        debug!(topic, message_id = %message_id, "published");
        Ok(message_id)
    }

    async fn create_subscription(
        &self,
        topic: &str,
        spec: &SubscriptionSpec,
    ) -> Result<(), TransportError> {
        let filter = match &spec.filter {
            Some(expression) => AttributeFilter::parse(expression)?,
            None => AttributeFilter::default(),
        };
        let mut state = self.inner.lock();
        if state.subscriptions.contains_key(&spec.name) {
            return Err(TransportError::AlreadyExists(spec.name.clone()));
        }
        let Some(subscriptions) = state.topics.get_mut(topic) else {
            return Err(TransportError::TopicNotFound(topic.to_string()));
        };
        subscriptions.push(spec.name.clone());
        let sink = Arc::new(BrokerAckSink {
            broker: Arc::downgrade(&self.inner),
            subscription: spec.name.clone(),
        });
        state.subscriptions.insert(
            spec.name.clone(),
            SubscriptionState {
                topic: topic.to_string(),
                filter,
                sender: None,
                sink,
                backlog: VecDeque::new(),
                unacked: HashMap::new(),
                counters: SubscriptionCounters::default(),
            },
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription: &str,
        capacity: usize,
    ) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        {
            let mut state = self.inner.lock();
            let Some(sub) = state.subscriptions.get_mut(subscription) else {
                return Err(TransportError::SubscriptionNotFound(
                    subscription.to_string(),
                ));
            };
            if sub.sender.as_ref().is_some_and(|s| !s.is_closed()) {
                return Err(TransportError::Unavailable(format!(
                    "subscription {subscription} already has an active subscriber"
                )));
            }
            sub.sender = Some(tx);
            self.inner.flush(sub);
        }

        let broker = Arc::downgrade(&self.inner);
        let name = subscription.to_string();
        Ok(Subscription::new(subscription, rx, move || {
            let Some(broker) = broker.upgrade() else {
                return Err(TransportError::Closed);
            };
            let mut state = broker.lock();
            match state.subscriptions.get_mut(&name) {
                Some(sub) => {
                    sub.sender = None;
                    Ok(())
                }
                None => Err(TransportError::SubscriptionNotFound(name)),
            }
        }))
    }
}

/// Backend stand-in that answers requests from one subscription.
///
/// Each request is handled on its own task; when the handler returns a
/// payload, a reply carrying the request's `request_id` (and its shard/session
/// routing attributes) is published to the response topic. Requests are acked
/// once handled, whether or not a reply was produced.
pub struct Responder {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    handled: Arc<AtomicU64>,
}

impl Responder {
    pub async fn spawn<F>(
        broker: InMemoryBroker,
        request_subscription: &str,
        response_topic: impl Into<String>,
        handler: F,
    ) -> Result<Self, TransportError>
    where
        F: Fn(&ReceivedMessage) -> Option<Bytes> + Send + Sync + 'static,
    {
        Self::spawn_with_delay(
            broker,
            request_subscription,
            response_topic,
            Duration::ZERO,
            handler,
        )
        .await
    }

    /// Like [`Responder::spawn`], waiting `delay` before each reply.
    pub async fn spawn_with_delay<F>(
        broker: InMemoryBroker,
        request_subscription: &str,
        response_topic: impl Into<String>,
        delay: Duration,
        handler: F,
    ) -> Result<Self, TransportError>
    where
        F: Fn(&ReceivedMessage) -> Option<Bytes> + Send + Sync + 'static,
    {
        let mut subscription = broker.subscribe(request_subscription, 1024).await?;
        let response_topic = response_topic.into();
        let handler = Arc::new(handler);
        let handled = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task_handled = Arc::clone(&handled);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    maybe_msg = subscription.recv() => {
                        let Some(inbound) = maybe_msg else { break };
                        let broker = broker.clone();
                        let handler = Arc::clone(&handler);
                        let handled = Arc::clone(&task_handled);
                        let topic = response_topic.clone();
                        tokio::spawn(async move {
                            let (request, ack) = inbound.into_parts();
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            if let Some(payload) = handler(&request) {
                                let reply = OutboundMessage::new(payload, reply_attributes(&request));
                                if let Err(err) = broker.publish(&topic, reply).await {
                                    warn!(%err, topic = %topic, "responder failed to publish reply");
                                }
                            }
                            handled.fetch_add(1, Ordering::Relaxed);
                            ack.ack();
                        });
                    }
                }
            }
            if let Err(err) = subscription.close() {
                warn!(%err, "responder failed to close subscription");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            handled,
        })
    }

    /// Number of requests handled so far.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn reply_attributes(request: &ReceivedMessage) -> Attributes {
    [REQUEST_ID, SHARD_INDEX, SESSION_ID]
        .into_iter()
        .filter_map(|key| {
            request
                .attribute(key)
                .map(|value| (key.to_string(), value.to_string()))
        })
        .collect()
}
