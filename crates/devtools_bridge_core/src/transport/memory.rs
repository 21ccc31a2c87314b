//! In-process transport that plays the browser side from a test.
//!
//! Every successful [`MemoryConnector::open`] yields a [`MemoryPeer`] on the
//! receiver returned by [`MemoryConnector::new`]. The peer sees every frame the
//! client writes and can inject responses, events, garbage, or hang up.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use super::{Connector, FrameSink, FrameSource};
use crate::{DevToolsError, Result};

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    failures_left: AtomicU32,
    opened: AtomicU32,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            failures_left: AtomicU32::new(0),
            opened: AtomicU32::new(0),
        };
        (connector, peer_rx)
    }

    /// The next `n` opens fail with a connection error.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Number of open attempts, failed ones included.
    pub fn open_attempts(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, endpoint: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DevToolsError::connection(endpoint, "connection refused"));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (hangup_tx, hangup_rx) = oneshot::channel();

        let peer = MemoryPeer {
            endpoint: endpoint.to_string(),
            outbound: outbound_rx,
            injector: PeerInjector { inbound: inbound_tx },
            hangup: Some(hangup_tx),
        };
        // A dropped peer receiver simply means nobody plays the browser.
        let _ = self.peers.send(peer);

        Ok((
            Box::new(MemorySink {
                outbound: Some(outbound_tx),
            }),
            Box::new(MemorySource {
                inbound: inbound_rx,
                hangup: hangup_rx,
                hung_up: false,
            }),
        ))
    }
}

struct MemorySink {
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| DevToolsError::Transport("sink already closed".into()))?;
        outbound
            .send(text)
            .map_err(|_| DevToolsError::Transport("peer is gone".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.outbound.take();
        Ok(())
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<String>,
    hangup: oneshot::Receiver<()>,
    hung_up: bool,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Option<Result<String>> {
        if self.hung_up {
            return None;
        }
        tokio::select! {
            biased;
            frame = self.inbound.recv() => frame.map(Ok),
            _ = &mut self.hangup => {
                self.hung_up = true;
                None
            }
        }
    }
}

/// Cloneable handle for pushing frames at the client.
#[derive(Debug, Clone)]
pub struct PeerInjector {
    inbound: mpsc::UnboundedSender<String>,
}

impl PeerInjector {
    /// `false` once the client side is gone.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.inbound.send(text.into()).is_ok()
    }

    pub fn respond(&self, id: u64, result: Value) -> bool {
        self.send_raw(json!({"id": id, "result": result}).to_string())
    }

    pub fn respond_error(&self, id: u64, code: i64, message: &str) -> bool {
        self.send_raw(json!({"id": id, "error": {"code": code, "message": message}}).to_string())
    }

    pub fn emit(&self, method: &str, params: Value) -> bool {
        self.send_raw(json!({"method": method, "params": params}).to_string())
    }
}

/// The browser end of one in-memory connection.
pub struct MemoryPeer {
    endpoint: String,
    outbound: mpsc::UnboundedReceiver<String>,
    injector: PeerInjector,
    hangup: Option<oneshot::Sender<()>>,
}

impl MemoryPeer {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn injector(&self) -> PeerInjector {
        self.injector.clone()
    }

    /// Next raw frame written by the client, `None` once its sink is closed.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next outbound call, parsed.
    pub async fn next_call(&mut self) -> Option<Value> {
        let frame = self.next_frame().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Reads the next call and answers it with `result`.
    pub async fn answer_next(&mut self, result: Value) -> Option<Value> {
        let call = self.next_call().await?;
        let id = call.get("id").and_then(Value::as_u64)?;
        self.injector.respond(id, result);
        Some(call)
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.injector.send_raw(text)
    }

    pub fn respond(&self, id: u64, result: Value) -> bool {
        self.injector.respond(id, result)
    }

    pub fn respond_error(&self, id: u64, code: i64, message: &str) -> bool {
        self.injector.respond_error(id, code, message)
    }

    pub fn emit(&self, method: &str, params: Value) -> bool {
        self.injector.emit(method, params)
    }

    /// Closes the connection from the browser side. Frames injected earlier
    /// are still delivered first.
    pub fn hang_up(&mut self) {
        if let Some(hangup) = self.hangup.take() {
            let _ = hangup.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut sink, mut source) = connector.open("mem://a").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.endpoint(), "mem://a");

        sink.send(r#"{"id":1}"#.to_string()).await.unwrap();
        assert_eq!(peer.next_call().await, Some(json!({"id": 1})));

        assert!(peer.respond(1, json!({"ok": true})));
        let frame = source.receive().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&frame).unwrap(),
            json!({"id": 1, "result": {"ok": true}})
        );
    }

    #[tokio::test]
    async fn test_hang_up_delivers_pending_frames_first() {
        let (connector, mut peers) = MemoryConnector::new();
        let (_sink, mut source) = connector.open("mem://b").await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        peer.emit("Page.loadEventFired", json!({}));
        peer.hang_up();

        assert!(source.receive().await.unwrap().is_ok());
        assert!(source.receive().await.is_none());
        assert!(source.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_peer_closes_source() {
        let (connector, mut peers) = MemoryConnector::new();
        let (_sink, mut source) = connector.open("mem://c").await.unwrap();
        drop(peers.recv().await.unwrap());
        assert!(source.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_first_opens() {
        let (connector, _peers) = MemoryConnector::new();
        let connector = connector.failing_first(2);

        assert!(connector.open("mem://d").await.is_err());
        assert!(connector.open("mem://d").await.is_err());
        assert!(connector.open("mem://d").await.is_ok());
        assert_eq!(connector.open_attempts(), 3);
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_sends() {
        let (connector, _peers) = MemoryConnector::new();
        let (mut sink, _source) = connector.open("mem://e").await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(matches!(
            sink.send("x".into()).await,
            Err(DevToolsError::Transport(_))
        ));
    }
}
