#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("identify timed out")]
    IdentifyTimeout,
    #[error("connection closed before identify")]
    Closed,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("signed-in sessions must present a JWT")]
    JwtRequired,
    #[error("JWT rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("JWT subject does not match the session")]
    SubjectMismatch,
    #[error("anonymous session does not belong to this client")]
    AddressMismatch,
    #[error("already identified")]
    AlreadyIdentified,
    #[error("not a participant of room {0}")]
    NotParticipant(String),
    #[error("not subscribed to room {0}")]
    NotSubscribed(String),
    #[error("an AI response is already streaming in this thread")]
    StreamInProgress,
    #[error("no AI response is streaming in this thread")]
    NoActiveStream,
    #[error(transparent)]
    Command(#[from] huddle_types::events::CommandError),
    #[error("database error: {0}")]
    Db(#[from] anyhow::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl GatewayError {
    /// Text sent back to the client in an `error` event. Infrastructure
    /// failures are not described to clients.
    pub fn client_message(&self) -> String {
        match self {
            Self::Db(_) | Self::Task(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}
