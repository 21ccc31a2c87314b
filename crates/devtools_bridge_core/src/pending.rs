//! Outstanding calls, keyed by identifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{DevToolsError, Result};

pub type CallOutcome = Result<Value>;

struct PendingEntry {
    method: String,
    created: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

/// The caller's half of a registered call. Dropping it, for instance when the
/// caller's future is cancelled, removes the call from the table.
pub struct PendingSlot {
    id: u64,
    method: String,
    rx: oneshot::Receiver<CallOutcome>,
    table: Weak<PendingCalls>,
}

impl PendingSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if table.forget(self.id) {
                tracing::debug!(id = self.id, method = %self.method, "call abandoned by caller");
            }
        }
    }
}

#[derive(Default)]
pub struct PendingCalls {
    entries: Mutex<HashMap<u64, PendingEntry>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails with `InvariantViolation` if `id` is already outstanding.
    pub fn register(self: &Arc<Self>, id: u64, method: &str) -> Result<PendingSlot> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(DevToolsError::InvariantViolation(format!(
                "call id {id} registered twice"
            )));
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                created: Instant::now(),
                tx,
            },
        );

        Ok(PendingSlot {
            id,
            method: method.to_string(),
            rx,
            table: Arc::downgrade(self),
        })
    }

    /// Wakes the waiter for `id`. Returns `false` (after logging) when nothing
    /// is waiting, which is what late or duplicate responses look like.
    pub fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            tracing::warn!(id, "dropping response for unknown call id");
            return false;
        };

        tracing::debug!(
            id,
            method = %entry.method,
            elapsed_ms = entry.created.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "resolved call"
        );
        // The waiter may have given up in the meantime; that is not an error.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Removes a call without resolving it.
    pub fn forget(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Resolves every outstanding call with `ConnectionClosed`.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(u64, PendingEntry)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(id, method = %entry.method, "failing call, connection closed");
            let _ = entry.tx.send(Err(DevToolsError::ConnectionClosed));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Waits for `slot` to be resolved. On timeout the entry is removed and any
    /// later response for it is dropped as unknown.
    pub async fn wait(&self, slot: PendingSlot, timeout: Duration) -> CallOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        self.wait_until(slot, deadline, timeout).await
    }

    /// Like [`wait`](Self::wait) against an absolute deadline; `budget` is the
    /// duration reported in `TimedOut`.
    pub async fn wait_until(
        &self,
        mut slot: PendingSlot,
        deadline: tokio::time::Instant,
        budget: Duration,
    ) -> CallOutcome {
        match tokio::time::timeout_at(deadline, &mut slot.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DevToolsError::ConnectionClosed),
            Err(_) => {
                if self.forget(slot.id) {
                    tracing::warn!(id = slot.id, method = %slot.method, timeout = ?budget, "call timed out");
                    return Err(DevToolsError::TimedOut {
                        method: slot.method.clone(),
                        after: budget,
                    });
                }
                // Resolved between the deadline and the removal.
                match slot.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DevToolsError::TimedOut {
                        method: slot.method.clone(),
                        after: budget,
                    }),
                }
            }
        }
    }
}
