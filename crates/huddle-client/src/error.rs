use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connect(String),

    #[error("not connected")]
    NotConnected,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("server rejected identify: {0}")]
    Rejected(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },
}
