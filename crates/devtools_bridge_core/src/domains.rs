//! Enabled domains and the options they were enabled with.
//!
//! The registry only records state; sending `Domain.enable` / `Domain.disable`
//! and waiting for the acknowledgement is the client's job. Event admission
//! follows the registry because enabling opens the domain's queue in the
//! [`EventBuffer`] and disabling closes it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::events::EventBuffer;

#[derive(Debug, Clone, PartialEq)]
pub struct DomainState {
    pub name: String,
    pub options: Value,
}

/// Domains are kept in the order they were first enabled, which is the order
/// a reconnect replays them in.
pub struct DomainRegistry {
    domains: Mutex<Vec<DomainState>>,
    events: Arc<EventBuffer>,
}

/// Returned by [`DomainRegistry::begin_enable`]; hand it back to
/// `commit_enable` or `abort_enable`.
#[must_use]
pub struct EnableTicket {
    domain: String,
    was_enabled: bool,
}

impl DomainRegistry {
    pub fn new(events: Arc<EventBuffer>) -> Self {
        Self {
            domains: Mutex::new(Vec::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DomainState>> {
        self.domains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the event queue before the enable call goes out, so events the
    /// browser emits ahead of its acknowledgement are kept.
    pub fn begin_enable(&self, domain: &str) -> EnableTicket {
        let was_enabled = self.is_enabled(domain);
        self.events.open(domain);
        EnableTicket {
            domain: domain.to_string(),
            was_enabled,
        }
    }

    /// Records the domain as enabled. A second enable only replaces options.
    pub fn commit_enable(&self, ticket: EnableTicket, options: Value) {
        let EnableTicket { domain, .. } = ticket;
        self.events.open(&domain);
        let mut domains = self.lock();
        match domains.iter_mut().find(|d| d.name == domain) {
            Some(existing) => existing.options = options,
            None => domains.push(DomainState {
                name: domain,
                options,
            }),
        }
    }

    pub fn abort_enable(&self, ticket: EnableTicket) {
        if !ticket.was_enabled && !self.is_enabled(&ticket.domain) {
            self.events.close_domain(&ticket.domain);
        }
    }

    /// Forgets the domain and drops its queued events.
    pub fn commit_disable(&self, domain: &str) -> bool {
        let removed = {
            let mut domains = self.lock();
            let before = domains.len();
            domains.retain(|d| d.name != domain);
            domains.len() != before
        };
        let dropped = self.events.close_domain(domain);
        if dropped > 0 {
            tracing::debug!(domain, dropped, "dropped queued events of disabled domain");
        }
        removed
    }

    pub fn is_enabled(&self, domain: &str) -> bool {
        self.lock().iter().any(|d| d.name == domain)
    }

    pub fn options(&self, domain: &str) -> Option<Value> {
        self.lock()
            .iter()
            .find(|d| d.name == domain)
            .map(|d| d.options.clone())
    }

    /// Enabled domains in the order they were first enabled.
    pub fn enabled(&self) -> Vec<DomainState> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EventEnvelope;
    use crate::config::EventCapacity;
    use serde_json::json;

    fn registry() -> (DomainRegistry, Arc<EventBuffer>) {
        let events = Arc::new(EventBuffer::new(EventCapacity::Unbounded));
        (DomainRegistry::new(Arc::clone(&events)), events)
    }

    fn event(method: &str) -> EventEnvelope {
        EventEnvelope {
            method: method.to_string(),
            params: json!({}),
        }
    }

    #[test]
    fn test_enable_records_state_and_opens_queue() {
        let (registry, events) = registry();
        let ticket = registry.begin_enable("Network");
        assert!(events.push(event("Network.requestWillBeSent")));
        assert!(!registry.is_enabled("Network"));

        registry.commit_enable(ticket, json!({"maxTotalBufferSize": 1000}));
        assert!(registry.is_enabled("Network"));
        assert_eq!(
            registry.options("Network"),
            Some(json!({"maxTotalBufferSize": 1000}))
        );
        assert_eq!(events.drain("Network").unwrap().len(), 1);
    }

    #[test]
    fn test_second_enable_updates_options_only() {
        let (registry, _events) = registry();
        let ticket = registry.begin_enable("Page");
        registry.commit_enable(ticket, json!({}));
        let ticket = registry.begin_enable("Page");
        registry.commit_enable(ticket, json!({"enableFileChooserOpenedEvent": true}));

        let enabled = registry.enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "Page");
        assert_eq!(enabled[0].options["enableFileChooserOpenedEvent"], true);
    }

    #[test]
    fn test_abort_enable_closes_fresh_queue_only() {
        let (registry, events) = registry();
        let ticket = registry.begin_enable("Log");
        registry.abort_enable(ticket);
        assert!(!events.is_open("Log"));

        let ticket = registry.begin_enable("Page");
        registry.commit_enable(ticket, json!({}));
        let ticket = registry.begin_enable("Page");
        registry.abort_enable(ticket);
        assert!(events.is_open("Page"));
        assert!(registry.is_enabled("Page"));
    }

    #[test]
    fn test_disable_drops_state_and_events() {
        let (registry, events) = registry();
        let ticket = registry.begin_enable("Runtime");
        registry.commit_enable(ticket, json!({}));
        events.push(event("Runtime.executionContextCreated"));

        assert!(registry.commit_disable("Runtime"));
        assert!(!registry.is_enabled("Runtime"));
        assert!(!events.push(event("Runtime.executionContextCreated")));
        assert!(events.drain("Runtime").is_none());
        assert!(!registry.commit_disable("Runtime"));
    }

    #[test]
    fn test_enabled_keeps_first_enable_order() {
        let (registry, _events) = registry();
        for name in ["Page", "Network", "DOM"] {
            let ticket = registry.begin_enable(name);
            registry.commit_enable(ticket, json!({}));
        }
        let ticket = registry.begin_enable("Page");
        registry.commit_enable(ticket, json!({"enableFileChooserOpenedEvent": true}));

        let names: Vec<_> = registry.enabled().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Page", "Network", "DOM"]);

        registry.commit_disable("Network");
        let ticket = registry.begin_enable("Network");
        registry.commit_enable(ticket, json!({}));
        let names: Vec<_> = registry.enabled().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Page", "DOM", "Network"]);
    }
}
