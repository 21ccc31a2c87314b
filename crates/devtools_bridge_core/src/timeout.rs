//! Default call timeout with scoped overrides.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The innermost live override wins; with none, the default applies.
pub struct TimeoutStack {
    default: Duration,
    overrides: Mutex<Vec<(u64, Duration)>>,
    next_token: AtomicU64,
}

impl TimeoutStack {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Duration)>> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default
    }

    pub fn effective(&self) -> Duration {
        self.lock().last().map(|(_, d)| *d).unwrap_or(self.default)
    }

    /// Installs `value` until the returned scope is dropped.
    pub fn push(&self, value: Duration) -> TimeoutScope<'_> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.lock().push((token, value));
        TimeoutScope { stack: self, token }
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }
}

/// Guard for a timeout override. Dropping it, on any exit path, removes
/// exactly this override even if scopes end out of order.
#[must_use = "the override ends as soon as the scope is dropped"]
pub struct TimeoutScope<'a> {
    stack: &'a TimeoutStack,
    token: u64,
}

impl TimeoutScope<'_> {
    pub fn value(&self) -> Option<Duration> {
        self.stack
            .lock()
            .iter()
            .find(|(token, _)| *token == self.token)
            .map(|(_, d)| *d)
    }
}

impl Drop for TimeoutScope<'_> {
    fn drop(&mut self) {
        let mut overrides = self.stack.lock();
        if let Some(pos) = overrides.iter().rposition(|(token, _)| *token == self.token) {
            overrides.remove(pos);
        }
    }
}
