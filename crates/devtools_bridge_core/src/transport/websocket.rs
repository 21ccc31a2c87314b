use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Connector, FrameSink, FrameSource};
use crate::discovery::DiscoveryClient;
use crate::{DevToolsError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects over WebSocket. An `http://` endpoint is first resolved to the
/// debugger URL of its first page target.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn resolve(&self, endpoint: &str) -> Result<String> {
        if is_websocket_url(endpoint) {
            return Ok(endpoint.to_string());
        }

        let discovery = DiscoveryClient::new(endpoint, self.connect_timeout)?;
        let target = discovery.first_page_target().await?;
        target.web_socket_debugger_url.ok_or_else(|| {
            DevToolsError::TargetNotFound(format!(
                "page target {} exposes no webSocketDebuggerUrl",
                target.id
            ))
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, endpoint: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let ws_url = self.resolve(endpoint).await?;
        tracing::info!(url = %ws_url, "connecting to DevTools WebSocket");

        let (ws_stream, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(&ws_url))
                .await
                .map_err(|_| {
                    DevToolsError::connection(
                        &ws_url,
                        format!("handshake timed out after {:?}", self.connect_timeout),
                    )
                })?
                .map_err(|e| DevToolsError::connection(&ws_url, e))?;

        let (writer, reader) = ws_stream.split();
        Ok((
            Box::new(WebSocketSink { writer }),
            Box::new(WebSocketSource { reader }),
        ))
    }
}

pub fn is_websocket_url(endpoint: &str) -> bool {
    endpoint.starts_with("ws://") || endpoint.starts_with("wss://")
}

struct WebSocketSink {
    writer: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| DevToolsError::Transport(format!("failed to send WebSocket message: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        self.writer
            .close()
            .await
            .map_err(|e| DevToolsError::Transport(format!("failed to close WebSocket: {e}")))
    }
}

struct WebSocketSource {
    reader: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn receive(&mut self) -> Option<Result<String>> {
        while let Some(msg_result) = self.reader.next().await {
            let msg = match msg_result {
                Ok(msg) => msg,
                Err(e) => {
                    return Some(Err(DevToolsError::Transport(format!(
                        "WebSocket read error: {e}"
                    ))))
                }
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!("dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => {
                    tracing::info!("WebSocket closed by remote");
                    return None;
                }
                _ => continue,
            }
        }
        None
    }
}
