use crate::codec::{self, CallEnvelope};
use crate::domains::DomainRegistry;
use crate::events::{Event, EventBuffer};
use crate::pending::PendingCalls;
use crate::reader::{self, ReaderHandle};
use crate::recovery::ReconnectBudget;
use crate::timeout::{TimeoutScope, TimeoutStack};
use crate::transport::{ConnectionState, Connector, Transport, WebSocketConnector};
use crate::{ClientConfig, DevToolsError, Result};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

struct Session {
    transport: Arc<Transport>,
    reader: Option<ReaderHandle>,
}

/// A debugging session with one browser target.
///
/// All methods take `&self`; share the client behind an `Arc` to issue calls
/// from several tasks. Identifiers are unique for the client's lifetime, across
/// reconnects.
pub struct Client {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    next_id: AtomicU64,
    pending: Arc<PendingCalls>,
    events: Arc<EventBuffer>,
    domains: DomainRegistry,
    timeouts: TimeoutStack,
    session: RwLock<Option<Session>>,
    closed_by_caller: AtomicBool,
    recovering: Mutex<()>,
    reconnect_budget: ReconnectBudget,
}

impl Client {
    /// Connects over WebSocket to `config.endpoint`.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connector = WebSocketConnector::new(config.connect_timeout);
        Self::connect_with(connector, config).await
    }

    pub async fn connect_with<C>(connector: C, config: ClientConfig) -> Result<Self>
    where
        C: Connector + 'static,
    {
        let events = Arc::new(EventBuffer::new(config.event_capacity));
        let client = Self {
            connector: Arc::new(connector),
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingCalls::new()),
            domains: DomainRegistry::new(Arc::clone(&events)),
            events,
            timeouts: TimeoutStack::new(config.timeout),
            session: RwLock::new(None),
            closed_by_caller: AtomicBool::new(false),
            recovering: Mutex::new(()),
            reconnect_budget: ReconnectBudget::new(config.reconnect_limit, config.reconnect_window),
            config,
        };

        let session = client.open_session().await?;
        *client.session.write().await = Some(session);
        Ok(client)
    }

    async fn open_session(&self) -> Result<Session> {
        let attempts = self.config.connect_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let opened = tokio::time::timeout(
                self.config.connect_timeout,
                Transport::open(self.connector.as_ref(), &self.config.endpoint),
            )
            .await
            .unwrap_or_else(|_| {
                Err(DevToolsError::connection(
                    &self.config.endpoint,
                    format!("timed out after {:?}", self.config.connect_timeout),
                ))
            });

            match opened {
                Ok((transport, source)) => {
                    self.events.reopen();
                    let reader = ReaderHandle::spawn(
                        source,
                        Arc::clone(&transport),
                        Arc::clone(&self.pending),
                        Arc::clone(&self.events),
                    );
                    tracing::info!(endpoint = %self.config.endpoint, attempt, "connected");
                    return Ok(Session {
                        transport,
                        reader: Some(reader),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        endpoint = %self.config.endpoint,
                        attempt,
                        attempts,
                        error = %e,
                        "connect attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
            }
        }

        Err(DevToolsError::RetriesExhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(DevToolsError::ConnectionClosed)),
        })
    }

    /// Closes the connection. Outstanding calls fail with `ConnectionClosed`.
    /// Calling it again, or after the browser hung up, is a no-op. A closed
    /// client is not reconnected automatically.
    pub async fn close(&self) -> Result<()> {
        self.closed_by_caller.store(true, Ordering::SeqCst);
        self.shutdown_session().await;
        Ok(())
    }

    async fn shutdown_session(&self) {
        let mut session = self.session.write().await;
        let Some(session) = session.as_mut() else {
            return;
        };
        let Some(reader) = session.reader.take() else {
            return;
        };

        tracing::info!(endpoint = %session.transport.endpoint(), "closing connection");
        session.transport.close().await;
        reader.stop().await;
        reader::finish(&session.transport, &self.pending, &self.events);
    }

    /// Replaces the connection with a fresh one and re-enables every domain
    /// that was enabled, in the order they were enabled, with the same options.
    pub async fn reconnect(&self) -> Result<()> {
        self.reopen().await.map(|_| ())
    }

    async fn reopen(&self) -> Result<Arc<Transport>> {
        self.shutdown_session().await;
        let session = self.open_session().await?;
        let transport = Arc::clone(&session.transport);
        *self.session.write().await = Some(session);
        self.closed_by_caller.store(false, Ordering::SeqCst);

        for domain in self.domains.enabled() {
            tracing::debug!(domain = %domain.name, "re-enabling domain");
            self.round_trip(
                &transport,
                &domain.name,
                "enable",
                domain.options,
                self.timeouts.effective(),
            )
            .await?;
        }
        Ok(transport)
    }

    /// Reconnects after the connection was lost, unless another caller already
    /// did or the reconnect budget is spent.
    async fn recover(&self) -> Result<Arc<Transport>> {
        let _recovering = self.recovering.lock().await;
        if let Ok(transport) = self.current_transport().await {
            return Ok(transport);
        }
        if self.closed_by_caller.load(Ordering::SeqCst) {
            return Err(DevToolsError::ConnectionClosed);
        }

        let losses = self.reconnect_budget.record_loss()?;
        tracing::warn!(endpoint = %self.config.endpoint, losses, "connection lost, reconnecting");
        self.reopen().await
    }

    pub async fn state(&self) -> ConnectionState {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.transport.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends `Domain.enable` with `options` as params and, once the browser
    /// acknowledges, starts buffering the domain's events. Enabling an enabled
    /// domain again only updates its options.
    pub async fn enable_domain(&self, domain: &str, options: Value) -> Result<()> {
        let options = if options.is_null() { json!({}) } else { options };
        let ticket = self.domains.begin_enable(domain);

        match self
            .call(domain, "enable", options.clone(), self.timeouts.effective())
            .await
        {
            Ok(_) => {
                self.domains.commit_enable(ticket, options);
                tracing::info!(domain, "domain enabled");
                Ok(())
            }
            Err(e) => {
                self.domains.abort_enable(ticket);
                Err(e)
            }
        }
    }

    /// Sends `Domain.disable`; once answered, the domain's queued events are
    /// dropped and further ones are discarded.
    pub async fn disable_domain(&self, domain: &str) -> Result<()> {
        if !self.domains.is_enabled(domain) {
            return Err(DevToolsError::DomainNotEnabled {
                domain: domain.to_string(),
            });
        }

        match self
            .call(domain, "disable", json!({}), self.timeouts.effective())
            .await
        {
            Ok(_) => {
                self.domains.commit_disable(domain);
                tracing::info!(domain, "domain disabled");
                Ok(())
            }
            Err(e @ DevToolsError::Protocol { .. }) => {
                self.domains.commit_disable(domain);
                tracing::warn!(domain, error = %e, "browser rejected disable, domain dropped locally");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_domain_enabled(&self, domain: &str) -> bool {
        self.domains.is_enabled(domain)
    }

    pub fn enabled_domains(&self) -> Vec<String> {
        self.domains.enabled().into_iter().map(|d| d.name).collect()
    }

    pub fn domain_options(&self, domain: &str) -> Option<Value> {
        self.domains.options(domain)
    }

    /// Calls `domain.method` and waits for the result using the effective
    /// timeout (innermost `with_timeout` scope, else the configured default).
    pub async fn execute(&self, domain: &str, method: &str, params: Value) -> Result<Value> {
        self.execute_with_timeout(domain, method, params, self.timeouts.effective())
            .await
    }

    pub async fn execute_with_timeout(
        &self,
        domain: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let toggles_domain = method == "enable" || method == "disable";
        if !toggles_domain
            && self.config.requires_enablement(domain)
            && !self.domains.is_enabled(domain)
        {
            return Err(DevToolsError::DomainNotEnabled {
                domain: domain.to_string(),
            });
        }

        self.call(domain, method, params, timeout).await
    }

    async fn call(
        &self,
        domain: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let transport = match self.current_transport().await {
            Ok(transport) => transport,
            Err(DevToolsError::ConnectionClosed) if self.config.auto_reconnect => {
                self.recover().await?
            }
            Err(e) => return Err(e),
        };

        self.round_trip(&transport, domain, method, params, timeout)
            .await
    }

    /// Sends one call on `transport` and waits for its answer. `timeout`
    /// bounds the write and the wait together.
    async fn round_trip(
        &self,
        transport: &Transport,
        domain: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = CallEnvelope::new(id, domain, method, params)?;
        let text = codec::encode(&envelope)?;

        // Register before sending so a fast response cannot miss its slot.
        // Every early return below drops the slot, which removes the entry.
        let slot = self.pending.register(id, &envelope.method)?;

        tracing::debug!(id, method = %envelope.method, "sending call");
        match tokio::time::timeout_at(deadline, transport.send(text)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(id, method = %envelope.method, ?timeout, "call timed out while sending");
                return Err(DevToolsError::TimedOut {
                    method: envelope.method,
                    after: timeout,
                });
            }
        }

        self.pending.wait_until(slot, deadline, timeout).await
    }

    async fn current_transport(&self) -> Result<Arc<Transport>> {
        let transport = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.transport))
            .ok_or(DevToolsError::ConnectionClosed)?;

        if !transport.is_open() {
            return Err(DevToolsError::ConnectionClosed);
        }
        Ok(transport)
    }

    /// Overrides the default timeout until the returned scope is dropped.
    /// The override is client-wide: concurrent callers see it too.
    pub fn with_timeout(&self, value: Duration) -> TimeoutScope<'_> {
        self.timeouts.push(value)
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeouts.effective()
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeouts.default_timeout()
    }

    /// Waits for the oldest event of `domain`. `None` uses the effective timeout.
    pub async fn next_event(&self, domain: &str, timeout: Option<Duration>) -> Result<Event> {
        self.wait_for_event(domain, |_| true, timeout).await
    }

    /// Waits for the first event of `domain` matching `predicate` and takes it
    /// out of the queue; events it skips over stay queued.
    pub async fn wait_for_event<F>(
        &self,
        domain: &str,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<Event>
    where
        F: Fn(&Event) -> bool + Send,
    {
        let timeout = timeout.unwrap_or_else(|| self.timeouts.effective());
        self.events.wait_for(domain, predicate, timeout).await
    }

    /// Takes all queued events of `domain`, in arrival order.
    pub fn drain_events(&self, domain: &str) -> Result<Vec<Event>> {
        self.events
            .drain(domain)
            .ok_or_else(|| DevToolsError::DomainNotEnabled {
                domain: domain.to_string(),
            })
    }

    /// Copy of the queued events of `domain`, left in place.
    pub fn peek_events(&self, domain: &str) -> Result<Vec<Event>> {
        self.events
            .snapshot(domain)
            .ok_or_else(|| DevToolsError::DomainNotEnabled {
                domain: domain.to_string(),
            })
    }

    /// Events of `domain` evicted by the capacity limit so far.
    pub fn overflow_count(&self, domain: &str) -> u64 {
        self.events.overflow(domain)
    }

    pub fn subscribe(&self, domain: &str) -> broadcast::Receiver<Event> {
        self.events.subscribe(domain)
    }

    /// Drops every buffered event. Domains stay enabled and identifiers keep
    /// counting up.
    pub fn reset(&self) {
        self.events.clear_all();
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut() {
            if let Some(reader) = session.reader.take() {
                reader.abort();
            }
        }
    }
}
