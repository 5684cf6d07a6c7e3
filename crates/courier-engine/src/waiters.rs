//! Table of calls awaiting a reply, keyed by correlation token.
//!
//! Every mutation happens under one mutex, and a waiter leaves the table
//! exactly once: whichever of resolve, fail, remove or drain gets to it first
//! wins and the others become no-ops. That is what turns at-least-once
//! delivery into at-most-once effect on the caller.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use courier_core::CorrelationToken;
use courier_transport::ReceivedMessage;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::CallError;

pub type Outcome = Result<ReceivedMessage, CallError>;

/// Receiving end of a registered waiter.
pub type PendingReply = oneshot::Receiver<Outcome>;

struct Waiter {
    slot: oneshot::Sender<Outcome>,
    created_at: Instant,
}

#[derive(Default)]
struct TableState {
    waiters: HashMap<CorrelationToken, Waiter>,
    closed: bool,
}

#[derive(Default)]
pub struct WaiterTable {
    state: Mutex<TableState>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for `token`.
    ///
    /// Fails with `EngineStopped` once the table has been drained, and with
    /// `DuplicateToken` if `token` is already waiting. The latter means the
    /// token source is broken and is logged at error level.
    pub fn insert(&self, token: CorrelationToken) -> Result<PendingReply, CallError> {
        let mut state = self.lock();
        if state.closed {
            return Err(CallError::EngineStopped);
        }
        if state.waiters.contains_key(&token) {
            error!(request_id = %token, "duplicate correlation token");
            return Err(CallError::DuplicateToken(token));
        }
        let (slot, rx) = oneshot::channel();
        debug!(request_id = %token, pending = state.waiters.len() + 1, "registered waiter");
        state.waiters.insert(
            token,
            Waiter {
                slot,
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    fn take(&self, token: &CorrelationToken) -> Option<Waiter> {
        self.lock().waiters.remove(token)
    }

    /// Fulfils the waiter with a reply. Returns false when no waiter matched,
    /// e.g. a duplicate delivery or a reply arriving after the caller gave up.
    pub fn resolve(&self, token: &CorrelationToken, reply: ReceivedMessage) -> bool {
        let Some(waiter) = self.take(token) else {
            return false;
        };
        debug!(
            request_id = %token,
            waited_ms = waiter.created_at.elapsed().as_millis() as u64,
            "resolved waiter"
        );
        // A dropped receiver means the caller was cancelled mid-flight.
        let _ = waiter.slot.send(Ok(reply));
        true
    }

    /// Fails the waiter. Same atomicity as [`WaiterTable::resolve`].
    pub fn fail(&self, token: &CorrelationToken, error: CallError) -> bool {
        let Some(waiter) = self.take(token) else {
            return false;
        };
        debug!(request_id = %token, %error, "failed waiter");
        let _ = waiter.slot.send(Err(error));
        true
    }

    /// Removes the waiter without fulfilling it. Used on timeout/cancellation.
    pub fn remove(&self, token: &CorrelationToken) -> Option<Duration> {
        self.take(token).map(|waiter| waiter.created_at.elapsed())
    }

    /// Closes the table and fails every remaining waiter with `EngineStopped`.
    ///
    /// Returns how many waiters were failed. Later inserts are rejected.
    pub fn drain(&self) -> usize {
        let drained: Vec<(CorrelationToken, Waiter)> = {
            let mut state = self.lock();
            state.closed = true;
            state.waiters.drain().collect()
        };
        let count = drained.len();
        for (token, waiter) in drained {
            debug!(request_id = %token, "draining waiter");
            let _ = waiter.slot.send(Err(CallError::EngineStopped));
        }
        count
    }

    pub fn contains(&self, token: &CorrelationToken) -> bool {
        self.lock().waiters.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
