use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::is_valid_share_code;

/// Upper bound on a single typing/stop command payload or identify token.
pub const MAX_TOKEN_LEN: usize = 4096;

/// Why a participant disappeared from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The room creator removed the participant.
    Removed,
    /// The room ran past `expires_at`; nobody was actively removed.
    RoomExpired,
}

/// Per-thread presence summary carried by `cross-thread-activity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadActivity {
    pub thread_id: Option<Uuid>,
    pub active: Vec<String>,
    pub typing: Vec<String>,
}

/// Events sent over the gateway, server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// Identify accepted
    Ready {
        session_id: String,
        user_id: Option<Uuid>,
    },

    /// Reply to a client ping, correlated by id
    Pong { id: u64 },

    /// A command was rejected
    Error { message: String },

    /// A message (user or AI) was persisted
    RoomMessageCreated {
        share_code: String,
        id: Uuid,
        thread_id: Option<Uuid>,
        sender_session: String,
        sender_name: String,
        content: String,
        is_ai: bool,
        created_at: DateTime<Utc>,
    },

    UserTyping {
        share_code: String,
        thread_id: Option<Uuid>,
        session_id: String,
        display_name: String,
        is_typing: bool,
    },

    UserJoinedRoom {
        share_code: String,
        session_id: String,
        display_name: String,
    },

    UserLeftRoom {
        share_code: String,
        session_id: String,
        display_name: String,
    },

    UserRemovedFromRoom {
        share_code: String,
        session_id: String,
        reason: RemovalReason,
    },

    AiStreamStart {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
        model: String,
    },

    AiContentStart {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
    },

    AiStreamChunk {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
        content: String,
    },

    AiStreamEnd {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
        message_id: Uuid,
    },

    /// Someone asked the in-flight stream to stop
    AiStopped {
        share_code: String,
        thread_id: Option<Uuid>,
        stopped_by: String,
    },

    /// The stream acknowledged the stop and discarded its output
    AiStreamStopped {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
    },

    AiError {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
        message: String,
    },

    AiFallbackUsed {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
        model: String,
    },

    AiReasoningStart {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
    },

    AiReasoningChunk {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
        content: String,
    },

    AiReasoningEnd {
        share_code: String,
        thread_id: Option<Uuid>,
        stream_id: Uuid,
    },

    /// Room-wide summary of which threads have active or typing users
    CrossThreadActivity {
        share_code: String,
        threads: Vec<ThreadActivity>,
    },

    /// Personal channel: a room the user belongs to gained a thread
    ThreadCreated {
        share_code: String,
        thread_id: Uuid,
        title: String,
        created_by: String,
    },

    /// Personal channel: the sidebar entry for a room is stale
    SidebarRefreshRequested { share_code: String },
}

impl RoomEvent {
    /// Share code of the room this event belongs to. `None` for connection-level events.
    pub fn share_code(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } | Self::Pong { .. } | Self::Error { .. } => None,
            Self::RoomMessageCreated { share_code, .. }
            | Self::UserTyping { share_code, .. }
            | Self::UserJoinedRoom { share_code, .. }
            | Self::UserLeftRoom { share_code, .. }
            | Self::UserRemovedFromRoom { share_code, .. }
            | Self::AiStreamStart { share_code, .. }
            | Self::AiContentStart { share_code, .. }
            | Self::AiStreamChunk { share_code, .. }
            | Self::AiStreamEnd { share_code, .. }
            | Self::AiStopped { share_code, .. }
            | Self::AiStreamStopped { share_code, .. }
            | Self::AiError { share_code, .. }
            | Self::AiFallbackUsed { share_code, .. }
            | Self::AiReasoningStart { share_code, .. }
            | Self::AiReasoningChunk { share_code, .. }
            | Self::AiReasoningEnd { share_code, .. }
            | Self::CrossThreadActivity { share_code, .. }
            | Self::ThreadCreated { share_code, .. }
            | Self::SidebarRefreshRequested { share_code } => Some(share_code),
        }
    }

    /// Thread an event is scoped to. The outer `None` means the event is not
    /// thread-scoped at all; `Some(None)` is the room's main conversation.
    pub fn thread_scope(&self) -> Option<Option<Uuid>> {
        match self {
            Self::RoomMessageCreated { thread_id, .. }
            | Self::UserTyping { thread_id, .. }
            | Self::AiStreamStart { thread_id, .. }
            | Self::AiContentStart { thread_id, .. }
            | Self::AiStreamChunk { thread_id, .. }
            | Self::AiStreamEnd { thread_id, .. }
            | Self::AiStopped { thread_id, .. }
            | Self::AiStreamStopped { thread_id, .. }
            | Self::AiError { thread_id, .. }
            | Self::AiFallbackUsed { thread_id, .. }
            | Self::AiReasoningStart { thread_id, .. }
            | Self::AiReasoningChunk { thread_id, .. }
            | Self::AiReasoningEnd { thread_id, .. } => Some(*thread_id),
            _ => None,
        }
    }

    /// Events delivered on a user's personal channel rather than a room channel.
    pub fn is_personal(&self) -> bool {
        matches!(
            self,
            Self::ThreadCreated { .. } | Self::SidebarRefreshRequested { .. }
        )
    }
}

/// Commands sent FROM client TO server over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RoomCommand {
    /// Authenticate the connection. `auth_<userId>` tokens must carry a JWT
    /// whose subject matches; `anon_…` tokens stand alone.
    Identify {
        token: String,
        #[serde(default)]
        jwt: Option<String>,
    },

    JoinRoom { share_code: String },

    LeaveRoom { share_code: String },

    JoinUserChannel,

    LeaveUserChannel,

    Typing {
        share_code: String,
        thread_id: Option<Uuid>,
        is_typing: bool,
    },

    /// Ask the AI stream running in a thread to stop
    StopAi {
        share_code: String,
        thread_id: Option<Uuid>,
    },

    Ping { id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("invalid share code: {0:?}")]
    ShareCode(String),
    #[error("token too long ({0} bytes)")]
    TokenTooLong(usize),
    #[error("empty token")]
    EmptyToken,
}

impl RoomCommand {
    /// Reject structurally valid JSON that still makes no sense to dispatch.
    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Self::Identify { token, jwt } => {
                if token.is_empty() {
                    return Err(CommandError::EmptyToken);
                }
                let longest = token.len().max(jwt.as_ref().map_or(0, |j| j.len()));
                if longest > MAX_TOKEN_LEN {
                    return Err(CommandError::TokenTooLong(longest));
                }
                Ok(())
            }
            Self::JoinRoom { share_code }
            | Self::LeaveRoom { share_code }
            | Self::Typing { share_code, .. }
            | Self::StopAi { share_code, .. } => {
                if is_valid_share_code(share_code) {
                    Ok(())
                } else {
                    Err(CommandError::ShareCode(share_code.clone()))
                }
            }
            Self::JoinUserChannel | Self::LeaveUserChannel | Self::Ping { .. } => Ok(()),
        }
    }
}
