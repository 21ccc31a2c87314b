//! Per-domain event queues.
//!
//! A domain has a queue exactly while it is enabled; events for any other
//! domain are dropped on arrival. Queues are FIFO, optionally bounded with
//! oldest-first eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, Notify};

use crate::codec::{split_method, EventEnvelope};
use crate::config::EventCapacity;
use crate::{DevToolsError, Result};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Domain-qualified, e.g. `Network.requestWillBeSent`.
    pub method: String,
    pub params: Value,
    /// Arrival order on the connection, shared by all domains.
    pub seq: u64,
}

impl Event {
    pub fn domain(&self) -> &str {
        split_method(&self.method).map(|(d, _)| d).unwrap_or_default()
    }

    /// Event name without the domain prefix.
    pub fn name(&self) -> &str {
        split_method(&self.method).map(|(_, n)| n).unwrap_or_default()
    }
}

#[derive(Default)]
struct DomainQueue {
    events: VecDeque<Event>,
    overflow: u64,
}

#[derive(Default)]
struct Queues {
    queues: HashMap<String, DomainQueue>,
    next_seq: u64,
    closed: bool,
}

pub struct EventBuffer {
    capacity: EventCapacity,
    inner: Mutex<Queues>,
    notify: Notify,
    subscribers: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl EventBuffer {
    pub fn new(capacity: EventCapacity) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Queues::default()),
            notify: Notify::new(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts accepting events for `domain`. Returns `false` if it already was.
    pub fn open(&self, domain: &str) -> bool {
        let mut inner = self.lock();
        if inner.queues.contains_key(domain) {
            return false;
        }
        inner.queues.insert(domain.to_string(), DomainQueue::default());
        true
    }

    /// Stops accepting events for `domain` and drops what is queued.
    pub fn close_domain(&self, domain: &str) -> usize {
        let dropped = self
            .lock()
            .queues
            .remove(domain)
            .map(|q| q.events.len())
            .unwrap_or(0);
        self.notify.notify_waiters();
        dropped
    }

    pub fn is_open(&self, domain: &str) -> bool {
        self.lock().queues.contains_key(domain)
    }

    /// Appends the event if its domain is open; otherwise drops it silently.
    pub fn push(&self, envelope: EventEnvelope) -> bool {
        let domain = envelope.domain().to_string();

        let event = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let Some(queue) = inner.queues.get_mut(&domain) else {
                tracing::trace!(method = %envelope.method, "discarding event for disabled domain");
                return false;
            };

            let event = Event {
                method: envelope.method,
                params: envelope.params,
                seq: inner.next_seq,
            };
            inner.next_seq += 1;

            if let EventCapacity::Bounded(limit) = self.capacity {
                while queue.events.len() >= limit.max(1) {
                    queue.events.pop_front();
                    queue.overflow += 1;
                }
            }
            queue.events.push_back(event.clone());
            event
        };

        self.publish(&domain, event);
        self.notify.notify_waiters();
        true
    }

    fn publish(&self, domain: &str, event: Event) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = subscribers.get(domain) {
            // No live receivers is fine.
            let _ = tx.send(event);
        }
    }

    /// Live feed of events accepted for `domain` from now on. Buffering is
    /// unaffected.
    pub fn subscribe(&self, domain: &str) -> broadcast::Receiver<Event> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers
            .entry(domain.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Takes every queued event for `domain`, oldest first. `None` if the
    /// domain is not open.
    pub fn drain(&self, domain: &str) -> Option<Vec<Event>> {
        self.lock()
            .queues
            .get_mut(domain)
            .map(|q| q.events.drain(..).collect())
    }

    /// Copy of the queue, left intact.
    pub fn snapshot(&self, domain: &str) -> Option<Vec<Event>> {
        self.lock()
            .queues
            .get(domain)
            .map(|q| q.events.iter().cloned().collect())
    }

    pub fn overflow(&self, domain: &str) -> u64 {
        self.lock().queues.get(domain).map(|q| q.overflow).unwrap_or(0)
    }

    /// Empties every queue; domains stay open.
    pub fn clear_all(&self) {
        for queue in self.lock().queues.values_mut() {
            queue.events.clear();
        }
    }

    /// Waiters stop waiting for new events once the connection is gone.
    pub fn mark_closed(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Removes and returns the first queued event matching `predicate`, waiting
    /// up to `timeout` for one to arrive. Non-matching events stay queued.
    pub async fn wait_for<F>(&self, domain: &str, predicate: F, timeout: Duration) -> Result<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.lock();
                let inner = &mut *guard;
                let queue = inner.queues.get_mut(domain).ok_or_else(|| {
                    DevToolsError::DomainNotEnabled {
                        domain: domain.to_string(),
                    }
                })?;

                if let Some(pos) = queue.events.iter().position(|e| predicate(e)) {
                    if let Some(event) = queue.events.remove(pos) {
                        return Ok(event);
                    }
                }
                if inner.closed {
                    return Err(DevToolsError::ConnectionClosed);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DevToolsError::TimedOut {
                    method: format!("{domain} event"),
                    after: timeout,
                });
            }
        }
    }
}
