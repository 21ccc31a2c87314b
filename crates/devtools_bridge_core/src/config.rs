use std::collections::BTreeSet;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:9222";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CONNECT_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_RECONNECT_LIMIT: u32 = 3;
const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(300);

/// How many events a single domain queue may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventCapacity {
    #[default]
    Unbounded,
    /// Oldest events are evicted once the queue holds this many.
    Bounded(usize),
}

impl EventCapacity {
    /// `0` means unbounded.
    pub fn from_limit(limit: usize) -> Self {
        if limit == 0 {
            Self::Unbounded
        } else {
            Self::Bounded(limit)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Either a debugging address (`http://host:port`, resolved through
    /// `/json`) or a WebSocket URL used verbatim.
    pub endpoint: String,
    /// Default per-call timeout, used outside any `with_timeout` scope.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Extra attempts after the first failed connect.
    pub connect_retries: u32,
    /// Linear backoff unit between connect attempts.
    pub retry_backoff: Duration,
    pub event_capacity: EventCapacity,
    /// Domains whose methods are rejected until the domain is enabled.
    pub required_domains: BTreeSet<String>,
    /// Reopen a lost connection on the next call instead of failing it.
    pub auto_reconnect: bool,
    /// Automatic reconnects allowed within one `reconnect_window` streak.
    pub reconnect_limit: u32,
    /// Losses further apart than this start a new streak.
    pub reconnect_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            event_capacity: EventCapacity::Unbounded,
            required_domains: BTreeSet::new(),
            auto_reconnect: false,
            reconnect_limit: DEFAULT_RECONNECT_LIMIT,
            reconnect_window: DEFAULT_RECONNECT_WINDOW,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        let endpoint = std::env::var("DEVTOOLS_ENDPOINT").unwrap_or(defaults.endpoint);

        let timeout = env_millis("DEVTOOLS_TIMEOUT_MS").unwrap_or(defaults.timeout);
        let connect_timeout =
            env_millis("DEVTOOLS_CONNECT_TIMEOUT_MS").unwrap_or(defaults.connect_timeout);
        let retry_backoff =
            env_millis("DEVTOOLS_RETRY_BACKOFF_MS").unwrap_or(defaults.retry_backoff);

        let connect_retries = std::env::var("DEVTOOLS_CONNECT_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.connect_retries);

        let event_capacity = std::env::var("DEVTOOLS_EVENT_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .map(EventCapacity::from_limit)
            .unwrap_or(defaults.event_capacity);

        let required_domains = std::env::var("DEVTOOLS_REQUIRED_DOMAINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let auto_reconnect = std::env::var("DEVTOOLS_AUTO_RECONNECT")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.auto_reconnect);
        let reconnect_limit = std::env::var("DEVTOOLS_RECONNECT_LIMIT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.reconnect_limit);
        let reconnect_window =
            env_millis("DEVTOOLS_RECONNECT_WINDOW_MS").unwrap_or(defaults.reconnect_window);

        Self {
            endpoint,
            timeout,
            connect_timeout,
            connect_retries,
            retry_backoff,
            event_capacity,
            required_domains,
            auto_reconnect,
            reconnect_limit,
            reconnect_window,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.connect_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_event_capacity(mut self, capacity: EventCapacity) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Turns on automatic reconnects, allowing `limit` of them per streak of
    /// losses no more than `window` apart.
    pub fn with_auto_reconnect(mut self, limit: u32, window: Duration) -> Self {
        self.auto_reconnect = true;
        self.reconnect_limit = limit;
        self.reconnect_window = window;
        self
    }

    /// Marks `domain` as one whose methods need `enable_domain` first.
    pub fn require_enabled(mut self, domain: impl Into<String>) -> Self {
        self.required_domains.insert(domain.into());
        self
    }

    pub fn requires_enablement(&self, domain: &str) -> bool {
        self.required_domains.contains(domain)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, "http://127.0.0.1:9222");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.event_capacity, EventCapacity::Unbounded);
        assert!(config.required_domains.is_empty());
        assert!(!config.auto_reconnect);
        assert_eq!(config.reconnect_limit, 3);
        assert_eq!(config.reconnect_window, Duration::from_secs(300));
    }

    #[test]
    fn test_new_config() {
        let config = ClientConfig::new("ws://localhost:9333/devtools/page/A", Duration::from_secs(5));
        assert_eq!(config.endpoint, "ws://localhost:9333/devtools/page/A");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.connect_retries, 3);
    }

    #[test]
    fn test_builder_methods() {
        let config = ClientConfig::default()
            .with_timeout(Duration::from_millis(250))
            .with_connect_retries(0, Duration::from_millis(10))
            .with_event_capacity(EventCapacity::Bounded(8))
            .require_enabled("Network")
            .with_auto_reconnect(5, Duration::from_secs(60));

        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.connect_retries, 0);
        assert_eq!(config.retry_backoff, Duration::from_millis(10));
        assert_eq!(config.event_capacity, EventCapacity::Bounded(8));
        assert!(config.requires_enablement("Network"));
        assert!(!config.requires_enablement("Page"));
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_limit, 5);
        assert_eq!(config.reconnect_window, Duration::from_secs(60));
    }

    #[test]
    fn test_capacity_from_limit() {
        assert_eq!(EventCapacity::from_limit(0), EventCapacity::Unbounded);
        assert_eq!(EventCapacity::from_limit(3), EventCapacity::Bounded(3));
    }

    // Both cases live in one test so they never race on the process environment.
    #[test]
    fn test_from_env_defaults_and_custom() {
        let keys = [
            "DEVTOOLS_ENDPOINT",
            "DEVTOOLS_TIMEOUT_MS",
            "DEVTOOLS_CONNECT_TIMEOUT_MS",
            "DEVTOOLS_CONNECT_RETRIES",
            "DEVTOOLS_RETRY_BACKOFF_MS",
            "DEVTOOLS_EVENT_CAPACITY",
            "DEVTOOLS_REQUIRED_DOMAINS",
            "DEVTOOLS_AUTO_RECONNECT",
            "DEVTOOLS_RECONNECT_LIMIT",
            "DEVTOOLS_RECONNECT_WINDOW_MS",
        ];
        for key in keys {
            std::env::remove_var(key);
        }

        let config = ClientConfig::from_env();
        assert_eq!(config.endpoint, "http://127.0.0.1:9222");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.event_capacity, EventCapacity::Unbounded);

        std::env::set_var("DEVTOOLS_ENDPOINT", "ws://custom:9999/devtools/page/X");
        std::env::set_var("DEVTOOLS_TIMEOUT_MS", "5000");
        std::env::set_var("DEVTOOLS_CONNECT_RETRIES", "not-a-number");
        std::env::set_var("DEVTOOLS_EVENT_CAPACITY", "100");
        std::env::set_var("DEVTOOLS_REQUIRED_DOMAINS", "Network, Page,,");
        std::env::set_var("DEVTOOLS_AUTO_RECONNECT", "true");
        std::env::set_var("DEVTOOLS_RECONNECT_WINDOW_MS", "60000");

        let config = ClientConfig::from_env();
        assert_eq!(config.endpoint, "ws://custom:9999/devtools/page/X");
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.event_capacity, EventCapacity::Bounded(100));
        assert!(config.requires_enablement("Network"));
        assert!(config.requires_enablement("Page"));
        assert_eq!(config.required_domains.len(), 2);
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnect_limit, 3);
        assert_eq!(config.reconnect_window, Duration::from_secs(60));

        for key in keys {
            std::env::remove_var(key);
        }
    }
}
