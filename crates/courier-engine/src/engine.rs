use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::attributes::{is_reserved, Attributes, REQUEST_ID};
use courier_core::{CallAttributes, CorrelationToken};
use courier_transport::{OutboundMessage, PubSubTransport, ReceivedMessage};
use futures_util::future::join_all;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{CallError, StartError};
use crate::limiter::ConcurrencyLimiter;
use crate::listener;
use crate::retry::RetryPolicy;
use crate::router::SubscriptionRouter;
use crate::stats::{EngineCounters, EngineStats};
use crate::waiters::WaiterTable;

/// Reply delivered to a successful call.
pub type Reply = ReceivedMessage;

const PHASE_IDLE: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_STOPPED: u8 = 2;

enum Lifecycle {
    Idle,
    Running {
        shutdown_tx: oneshot::Sender<()>,
        listener: JoinHandle<usize>,
    },
    Stopped,
}

struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn PubSubTransport>,
    router: SubscriptionRouter,
    waiters: Arc<WaiterTable>,
    limiter: ConcurrencyLimiter,
    counters: Arc<EngineCounters>,
    lifecycle: Mutex<Lifecycle>,
    phase: AtomicU8,
}

/// Correlation engine handle. Clones share one engine.
///
/// Dropping the last handle signals the listener to stop, which fails any
/// call still waiting.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Removes the waiter when the call ends without it being resolved, which
/// covers publish failures and a cancelled call future.
struct WaiterGuard<'a> {
    waiters: &'a WaiterTable,
    token: &'a CorrelationToken,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(self.token);
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn PubSubTransport>,
    ) -> Result<Self, StartError> {
        config.validate()?;
        let router = SubscriptionRouter::from_config(&config);
        let limiter = ConcurrencyLimiter::new(config.max_concurrent_calls);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                router,
                waiters: Arc::new(WaiterTable::new()),
                limiter,
                counters: Arc::new(EngineCounters::default()),
                lifecycle: Mutex::new(Lifecycle::Idle),
                phase: AtomicU8::new(PHASE_IDLE),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.inner.router
    }

    pub fn is_running(&self) -> bool {
        self.inner.phase.load(Ordering::Acquire) == PHASE_RUNNING
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.inner.waiters.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.inner
            .counters
            .snapshot(self.inner.waiters.len(), self.inner.limiter.in_flight())
    }

    /// Ensures the reply subscription exists, attaches to it and spawns the
    /// listener. Calls are accepted once this returns.
    pub async fn start(&self) -> Result<(), StartError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(StartError::AlreadyStarted),
            Lifecycle::Stopped => return Err(StartError::Stopped),
        }

        let config = &self.inner.config;
        let router = &self.inner.router;
        router
            .ensure_subscription(self.inner.transport.as_ref(), &config.response_topic)
            .await?;
        let subscription = self
            .inner
            .transport
            .subscribe(router.subscription_name(), config.listener_queue_capacity)
            .await?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let listener = tokio::spawn(listener::run(
            subscription,
            Arc::clone(&self.inner.waiters),
            Arc::clone(&self.inner.counters),
            shutdown_rx,
        ));
        *lifecycle = Lifecycle::Running {
            shutdown_tx,
            listener,
        };
        self.inner.phase.store(PHASE_RUNNING, Ordering::Release);
        info!(
            subscription = %router.subscription_path(),
            request_topic = %config.request_topic,
            max_concurrent_calls = config.max_concurrent_calls,
            "engine started"
        );
        Ok(())
    }

    /// Stops the listener and fails every outstanding call with
    /// [`CallError::EngineStopped`]. Idempotent, and safe before `start`.
    ///
    /// Returns how many outstanding calls were failed.
    pub async fn stop(&self) -> usize {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
        self.inner.phase.store(PHASE_STOPPED, Ordering::Release);

        let mut drained = 0;
        if let Lifecycle::Running {
            shutdown_tx,
            listener,
        } = previous
        {
            let _ = shutdown_tx.send(());
            match listener.await {
                Ok(count) => drained += count,
                Err(err) => warn!(%err, "listener task failed"),
            }
        }
        drained += self.inner.waiters.drain();
        self.inner.limiter.close();
        info!(drained, "engine stopped");
        drained
    }

    /// Issues one request and returns the reply payload.
    ///
    /// `timeout` overrides the configured call timeout; with neither set the
    /// call waits until a reply arrives or the engine stops.
    pub async fn call(
        &self,
        payload: impl Into<Bytes>,
        attributes: &CallAttributes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, CallError> {
        self.call_with_reply(payload, attributes, timeout)
            .await
            .map(|reply| reply.payload)
    }

    /// Like [`Engine::call`], returning the whole reply including its
    /// attributes.
    pub async fn call_with_reply(
        &self,
        payload: impl Into<Bytes>,
        attributes: &CallAttributes,
        timeout: Option<Duration>,
    ) -> Result<Reply, CallError> {
        self.ensure_running()?;
        let _permit = self.inner.limiter.acquire().await?;

        let counters = &self.inner.counters;
        EngineCounters::bump(&counters.issued);
        let result = self.issue(payload.into(), attributes, timeout).await;
        match &result {
            Ok(_) => EngineCounters::bump(&counters.succeeded),
            Err(CallError::Timeout(_)) => EngineCounters::bump(&counters.timed_out),
            Err(_) => EngineCounters::bump(&counters.failed),
        }
        result
    }

    /// Re-issues the call with a fresh token while it fails with a retryable
    /// error, pausing `policy.backoff_for(attempt)` between attempts.
    pub async fn call_with_retry(
        &self,
        payload: impl Into<Bytes>,
        attributes: &CallAttributes,
        timeout: Option<Duration>,
        policy: &RetryPolicy,
    ) -> Result<Bytes, CallError> {
        let payload = payload.into();
        let mut attempt = 1;
        loop {
            match self.call(payload.clone(), attributes, timeout).await {
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let backoff = policy.backoff_for(attempt);
                    warn!(
                        %err,
                        attempt,
                        max_attempts = policy.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "call failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Issues `count` concurrent calls with the same payload. Results keep
    /// issue order.
    pub async fn call_many(
        &self,
        payload: impl Into<Bytes>,
        attributes: &CallAttributes,
        count: usize,
        timeout: Option<Duration>,
    ) -> Vec<Result<Bytes, CallError>> {
        let payload = payload.into();
        join_all((0..count).map(|_| self.call(payload.clone(), attributes, timeout))).await
    }

    fn ensure_running(&self) -> Result<(), CallError> {
        match self.inner.phase.load(Ordering::Acquire) {
            PHASE_RUNNING => Ok(()),
            PHASE_IDLE => Err(CallError::NotStarted),
            _ => Err(CallError::EngineStopped),
        }
    }

    async fn issue(
        &self,
        payload: Bytes,
        attributes: &CallAttributes,
        timeout: Option<Duration>,
    ) -> Result<Reply, CallError> {
        let inner = &self.inner;
        let token = CorrelationToken::generate();
        let wire = self.wire_attributes(attributes, &token);

        let reply_rx = inner.waiters.insert(token.clone())?;
        let _guard = WaiterGuard {
            waiters: &inner.waiters,
            token: &token,
        };

        let message_id = inner
            .transport
            .publish(&inner.config.request_topic, OutboundMessage::new(payload, wire))
            .await
            .map_err(|err| {
                warn!(request_id = %token, %err, "publish failed");
                CallError::Publish(err)
            })?;
        debug!(request_id = %token, message_id = %message_id, "request published");

        let outcome = match timeout.or(inner.config.call_timeout) {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(request_id = %token, timeout_ms = limit.as_millis() as u64, "call timed out");
                    return Err(CallError::Timeout(limit));
                }
            },
            None => reply_rx.await,
        };
        // A dropped slot means the table was torn down with the engine.
        outcome.map_err(|_| CallError::EngineStopped)?
    }

    /// Caller attributes plus routing attributes and the correlation token.
    /// Caller-supplied reserved keys are dropped.
    fn wire_attributes(&self, attributes: &CallAttributes, token: &CorrelationToken) -> Attributes {
        let mut wire: Attributes = attributes
            .to_attributes()
            .into_iter()
            .filter(|(key, _)| {
                if is_reserved(key) {
                    warn!(key = %key, "ignoring caller-supplied reserved attribute");
                    return false;
                }
                true
            })
            .collect();
        wire.extend(self.inner.router.routing_attributes());
        wire.insert(REQUEST_ID.to_string(), token.as_str().to_string());
        wire
    }
}
