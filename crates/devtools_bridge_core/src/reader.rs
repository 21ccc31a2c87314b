//! The single background task reading a connection.
//!
//! Responses resolve pending calls, events go to the event buffer, malformed
//! frames are logged and skipped. When the stream ends every outstanding call
//! fails with `ConnectionClosed` and event waiters are released.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::codec::{self, Inbound};
use crate::events::EventBuffer;
use crate::pending::PendingCalls;
use crate::transport::{FrameSource, Transport};
use crate::DevToolsError;

const MAX_LOGGED_FRAME_CHARS: usize = 200;

pub struct ReaderHandle {
    task: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn spawn(
        source: Box<dyn FrameSource>,
        transport: Arc<Transport>,
        pending: Arc<PendingCalls>,
        events: Arc<EventBuffer>,
    ) -> Self {
        let task = tokio::spawn(async move {
            reader_loop(source, &transport, &pending, &events).await;
        });
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the task and waits for it to go away. Cleanup is the caller's
    /// job since an aborted loop never reaches its own.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn reader_loop(
    mut source: Box<dyn FrameSource>,
    transport: &Transport,
    pending: &PendingCalls,
    events: &EventBuffer,
) {
    loop {
        let text = match source.receive().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                tracing::warn!(endpoint = %transport.endpoint(), error = %e, "read failed, stopping reader");
                break;
            }
            None => {
                tracing::info!(endpoint = %transport.endpoint(), "connection closed");
                break;
            }
        };

        dispatch(&text, pending, events);
    }

    finish(transport, pending, events);
}

pub(crate) fn dispatch(text: &str, pending: &PendingCalls, events: &EventBuffer) {
    match codec::decode(text) {
        Ok(Inbound::Response(response)) => {
            let outcome = response.outcome.map_err(DevToolsError::from);
            pending.resolve(response.id, outcome);
        }
        Ok(Inbound::Event(event)) => {
            events.push(event);
        }
        Err(e) => {
            tracing::warn!(error = %e, frame = %truncate(text), "skipping malformed frame");
        }
    }
}

/// Marks the connection closed and releases everyone waiting on it.
pub(crate) fn finish(transport: &Transport, pending: &PendingCalls, events: &EventBuffer) {
    transport.mark_closed();
    let failed = pending.fail_all();
    if failed > 0 {
        tracing::warn!(failed, "connection closed with calls outstanding");
    }
    events.mark_closed();
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_LOGGED_FRAME_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventCapacity;
    use crate::transport::{ConnectionState, MemoryConnector, MemoryPeer};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        transport: Arc<Transport>,
        pending: Arc<PendingCalls>,
        events: Arc<EventBuffer>,
        reader: ReaderHandle,
        peer: MemoryPeer,
    }

    async fn harness() -> Harness {
        let (connector, mut peers) = MemoryConnector::new();
        let (transport, source) = Transport::open(&connector, "mem://reader").await.unwrap();
        let pending = Arc::new(PendingCalls::new());
        let events = Arc::new(EventBuffer::new(EventCapacity::Unbounded));
        let reader = ReaderHandle::spawn(
            source,
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::clone(&events),
        );
        let peer = peers.recv().await.unwrap();
        Harness {
            transport,
            pending,
            events,
            reader,
            peer,
        }
    }

    #[tokio::test]
    async fn test_routes_responses_and_events() {
        let h = harness().await;
        h.events.open("Page");
        let slot = h.pending.register(1, "Page.navigate").unwrap();

        h.peer.emit("Page.frameStartedLoading", json!({"frameId": "F"}));
        h.peer.respond(1, json!({"frameId": "F"}));

        let result = h.pending.wait(slot, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result["frameId"], "F");
        let events = h.events.drain("Page").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].method, "Page.frameStartedLoading");
        h.reader.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_loop() {
        let h = harness().await;
        let slot = h.pending.register(2, "Runtime.evaluate").unwrap();

        h.peer.send_raw("{not json");
        h.peer.send_raw(r#"{"params": {}}"#);
        h.peer.respond(2, json!({"result": {"type": "number", "value": 2}}));

        let result = h.pending.wait(slot, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result["result"]["value"], 2);
        assert!(!h.reader.is_finished());
        h.reader.stop().await;
    }

    #[tokio::test]
    async fn test_error_response_becomes_protocol_error() {
        let h = harness().await;
        let slot = h.pending.register(3, "DOM.describeNode").unwrap();
        h.peer.respond_error(3, -32000, "Could not find node with given id");

        let err = h.pending.wait(slot, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(
            err.protocol_kind(),
            Some(crate::ProtocolErrorKind::ResourceNotFound)
        );
        h.reader.stop().await;
    }

    #[tokio::test]
    async fn test_peer_close_fails_outstanding_calls() {
        let mut h = harness().await;
        let slots: Vec<_> = (10..13)
            .map(|id| h.pending.register(id, "Page.reload").unwrap())
            .collect();

        h.peer.hang_up();

        for slot in slots {
            let err = tokio::time::timeout(
                Duration::from_secs(5),
                h.pending.wait(slot, Duration::from_secs(60)),
            )
            .await
            .expect("waiter must be released")
            .unwrap_err();
            assert!(err.is_connection_closed());
        }
        assert_eq!(h.transport.state(), ConnectionState::Closed);
        assert!(h.pending.is_empty());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_LOGGED_FRAME_CHARS + 10);
        assert_eq!(truncate(&long).chars().count(), MAX_LOGGED_FRAME_CHARS);
        assert_eq!(truncate("short"), "short");
    }
}
