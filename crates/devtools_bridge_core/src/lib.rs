//! DevTools Bridge Core
//!
//! An async client for a browser's remote-debugging protocol (Chrome DevTools
//! Protocol style JSON-RPC over a persistent WebSocket). It owns the socket,
//! correlates calls with their responses, tracks which protocol domains are
//! enabled and buffers the events those domains push.
//!
//! ```ignore
//! use devtools_bridge_core::{Client, ClientConfig};
//! use serde_json::json;
//!
//! let client = Client::connect(ClientConfig::from_env()).await?;
//! client.enable_domain("Network", json!({})).await?;
//! client
//!     .execute("Network", "setUserAgentOverride", json!({"userAgent": "Test"}))
//!     .await?;
//! let events = client.drain_events("Network")?;
//! client.close().await?;
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod domains;
pub mod error;
pub mod events;
pub mod pending;
pub mod reader;
pub mod recovery;
pub mod timeout;
pub mod transport;

// Re-export commonly used types
pub use client::Client;
pub use config::{ClientConfig, EventCapacity};
pub use error::{DevToolsError, ProtocolErrorKind};
pub use events::Event;
pub use timeout::TimeoutScope;
pub use transport::ConnectionState;

/// Result type alias using DevToolsError
pub type Result<T> = std::result::Result<T, DevToolsError>;
