//! Budget for automatic reconnects.
//!
//! Connection losses are counted in streaks: a loss more than `window` after
//! the previous one starts a new streak. Once a streak holds more than `limit`
//! losses the client stops reconnecting on its own.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{DevToolsError, Result};

#[derive(Debug, Clone, Copy)]
struct Streak {
    last: Instant,
    count: u32,
}

pub struct ReconnectBudget {
    limit: u32,
    window: Duration,
    streak: Mutex<Option<Streak>>,
}

impl ReconnectBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            streak: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Streak>> {
        self.streak.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one loss. Fails with `ReconnectLimitExceeded` when the current
    /// streak goes over the limit.
    pub fn record_loss(&self) -> Result<u32> {
        let now = Instant::now();
        let mut streak = self.lock();

        let count = match *streak {
            Some(previous) if now.duration_since(previous.last) <= self.window => {
                previous.count.saturating_add(1)
            }
            _ => 1,
        };
        *streak = Some(Streak { last: now, count });

        if count > self.limit {
            return Err(DevToolsError::ReconnectLimitExceeded {
                failures: count,
                window: self.window,
            });
        }
        Ok(count)
    }

    /// Losses in the current streak.
    pub fn losses(&self) -> u32 {
        self.lock().map(|s| s.count).unwrap_or(0)
    }
}
