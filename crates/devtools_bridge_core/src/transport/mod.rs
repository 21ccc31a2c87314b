//! Message-stream transport.
//!
//! A [`Connector`] opens a connection and hands back its two halves: a
//! [`FrameSink`] that callers write through (serialized by a lock inside
//! [`Transport`]) and a [`FrameSource`] owned exclusively by the reader loop.
//! Nothing here looks inside the frames.

pub mod memory;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::{DevToolsError, Result};

pub use memory::{MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

/// How long `close` waits for an in-flight write before skipping the close
/// handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[async_trait]
pub trait FrameSink: Send {
    /// Writes one complete text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next complete text frame, `None` once the stream is closed.
    async fn receive(&mut self) -> Option<Result<String>>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

/// Write side and lifecycle state of one connection.
pub struct Transport {
    endpoint: String,
    state: watch::Sender<ConnectionState>,
    sink: Mutex<Box<dyn FrameSink>>,
}

impl Transport {
    /// Opens a connection through `connector`, returning the shared write side
    /// and the read half for the reader loop.
    pub async fn open(
        connector: &dyn Connector,
        endpoint: &str,
    ) -> Result<(Arc<Self>, Box<dyn FrameSource>)> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (sink, source) = connector.open(endpoint).await?;
        state.send_replace(ConnectionState::Open);

        let transport = Arc::new(Self {
            endpoint: endpoint.to_string(),
            state,
            sink: Mutex::new(sink),
        });
        Ok((transport, source))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Writes one frame. A write still waiting for the lock or for the sink
    /// when the connection starts closing fails with `ConnectionClosed`.
    pub async fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(DevToolsError::ConnectionClosed);
        }
        let state = self.state.subscribe();

        let mut sink = tokio::select! {
            sink = self.sink.lock() => sink,
            _ = closing(state.clone()) => return Err(DevToolsError::ConnectionClosed),
        };
        tokio::select! {
            sent = sink.send(text) => sent,
            _ = closing(state) => Err(DevToolsError::ConnectionClosed),
        }
    }

    /// Idempotent. The sink is closed even if the peer already hung up, and the
    /// state ends up `Closed` whether or not the close handshake succeeds.
    pub async fn close(&self) {
        let previous = self.state.send_replace(ConnectionState::Closing);
        if previous == ConnectionState::Closing {
            // another close is in flight and will finish the job
            return;
        }

        let handshake = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_GRACE, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "close handshake failed");
            }
            Err(_) => {
                tracing::warn!(endpoint = %self.endpoint, "sink busy, closing without handshake");
            }
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    pub(crate) fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}

async fn closing(mut state: watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|s| matches!(s, ConnectionState::Closing | ConnectionState::Closed))
        .await;
}

/// Test connectors for sinks that misbehave.
#[cfg(test)]
pub(crate) mod stuck {
    use super::*;

    /// Every write hangs forever, as with a peer that stopped reading.
    pub(crate) struct StuckConnector;

    struct StuckSink;
    struct SilentSource;

    #[async_trait]
    impl FrameSink for StuckSink {
        async fn send(&mut self, _text: String) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl FrameSource for SilentSource {
        async fn receive(&mut self) -> Option<Result<String>> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl Connector for StuckConnector {
        async fn open(
            &self,
            _endpoint: &str,
        ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
            Ok((Box::new(StuckSink), Box::new(SilentSource)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_send_and_close() {
        let (connector, mut peers) = MemoryConnector::new();
        let (transport, _source) = Transport::open(&connector, "mem://one").await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        assert_eq!(transport.state(), ConnectionState::Open);
        assert_eq!(transport.endpoint(), "mem://one");

        transport.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.next_frame().await.as_deref(), Some("hello"));

        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(peer.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let (connector, _peers) = MemoryConnector::new();
        let (transport, _source) = Transport::open(&connector, "mem://two").await.unwrap();

        transport.close().await;
        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Closed);

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_state_subscription_sees_closure() {
        let (connector, _peers) = MemoryConnector::new();
        let (transport, _source) = Transport::open(&connector, "mem://three").await.unwrap();
        let mut state = transport.subscribe_state();

        transport.mark_closed();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_releases_stuck_write() {
        let (transport, _source) = Transport::open(&stuck::StuckConnector, "mem://stuck")
            .await
            .unwrap();

        let writer = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.send("frame".to_string()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .expect("close must not wait on a stuck write");
        assert_eq!(transport.state(), ConnectionState::Closed);

        let outcome = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("stuck write must be released")
            .unwrap();
        assert!(outcome.unwrap_err().is_connection_closed());
    }
}
