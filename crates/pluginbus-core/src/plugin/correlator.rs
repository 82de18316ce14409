//! Request correlation for outgoing calls.
//!
//! Every outgoing request gets an id from a per-plugin counter and a parked
//! waiter in the pending map. The read loop hands responses to
//! [`RequestCorrelator::resolve`], which removes the waiter before delivering,
//! so each request is completed at most once. A caller that gives up drops its
//! [`PendingRequest`], which removes the entry; a late response for that id is
//! then discarded.

use crate::protocol::Envelope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct CorrelatorState {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Envelope>>,
}

/// Per-plugin request id allocator and pending-request map.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    state: Mutex<CorrelatorState>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id and park a waiter for it.
    pub fn begin(self: &Arc<Self>) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.pending.insert(id, tx);
            id
        };

        PendingRequest {
            id,
            receiver: rx,
            correlator: self.clone(),
        }
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns false if no request with that id is outstanding (it already
    /// completed, timed out, or never existed); the response is dropped.
    pub fn resolve(&self, response: Envelope) -> bool {
        let waiter = self.lock().pending.remove(&response.id);
        match waiter {
            Some(tx) => {
                let id = response.id;
                if tx.send(response).is_err() {
                    debug!("Waiter for request {} went away before delivery", id);
                }
                true
            }
            None => {
                warn!(
                    "Received response for unknown request id={} from {} ({})",
                    response.id, response.from, response.method
                );
                false
            }
        }
    }

    /// Remove a pending request without completing it.
    pub fn abandon(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Drop every outstanding waiter. Their callers observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let mut state = self.lock();
        let count = state.pending.len();
        state.pending.clear();
        count
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CorrelatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-flight request. Dropping it removes the pending entry.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    receiver: oneshot::Receiver<Envelope>,
    correlator: Arc<RequestCorrelator>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the correlated response.
    ///
    /// Returns `None` if the waiter was dropped without a response, which
    /// happens when the connection closes.
    pub async fn response(&mut self) -> Option<Envelope> {
        (&mut self.receiver).await.ok()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        // No-op when resolve() already took the entry; ids are never reused.
        if self.correlator.abandon(self.id) {
            debug!("Abandoned pending request {}", self.id);
        }
    }
}
