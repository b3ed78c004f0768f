use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use huddle_types::events::{RoomCommand, RoomEvent};

use crate::error::ClientError;

/// A duplex link to the gateway that speaks room commands and events.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), ClientError>;

    async fn send(&mut self, command: &RoomCommand) -> Result<(), ClientError>;

    /// Next event from the server. `None` once the link is gone.
    async fn recv(&mut self) -> Option<Result<RoomEvent, ClientError>>;

    /// Whether the underlying socket still looks open. Health checks can
    /// fail while this stays true.
    fn is_connected(&self) -> bool;

    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    url: String,
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self) -> Result<(), ClientError> {
        self.close().await;
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        info!("Connected to {} ({})", self.url, response.status());
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, command: &RoomCommand) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let text = serde_json::to_string(command)?;
        if let Err(e) = stream.send(Message::Text(text.into())).await {
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<RoomEvent, ClientError>> {
        loop {
            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(&text).map_err(ClientError::from));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Server closed the connection: {:?}", frame);
                    self.stream = None;
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("WebSocket read error: {}", e);
                    self.stream = None;
                    return Some(Err(e.into()));
                }
                None => {
                    self.stream = None;
                    return None;
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
