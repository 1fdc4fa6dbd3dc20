//! Client for a running devorch gateway

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientFrame, ClientMessage, ServerFrame};
use crate::{GatewayError, Result};

type Stream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Client for connecting to a devorch gateway
#[derive(Debug, Clone)]
pub struct GatewayClient {
    url: String,
}

impl GatewayClient {
    /// `url` is the full WebSocket endpoint, e.g. `ws://127.0.0.1:8766/ws`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn for_address(host: &str, port: u16) -> Self {
        Self::new(format!("ws://{}:{}/ws", host, port))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to the gateway
    pub async fn connect(&self) -> Result<GatewayConnection> {
        let (ws, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| GatewayError::WebSocket(format!("{}: {}", self.url, e)))?;
        tracing::debug!("Connected to {}", self.url);
        Ok(GatewayConnection { ws })
    }
}

/// An open observer connection
pub struct GatewayConnection {
    ws: Stream,
}

impl GatewayConnection {
    pub async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.send_raw(&text).await
    }

    pub async fn send_message(&mut self, message: ClientMessage) -> Result<()> {
        self.send(&ClientFrame::new(message)).await
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next server frame; `None` once the gateway closes the connection.
    /// Control frames are skipped; pings are answered by the socket.
    pub async fn recv(&mut self) -> Result<Option<ServerFrame>> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Skip frames until one of the given type arrives
    pub async fn recv_kind(&mut self, kind: &str) -> Result<Option<ServerFrame>> {
        while let Some(frame) = self.recv().await? {
            if frame.kind == kind {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    /// Close the connection
    pub async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
