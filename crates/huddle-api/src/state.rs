use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use huddle_db::Database;
use huddle_db::models::RoomRow;
use huddle_gateway::Dispatcher;
use huddle_types::events::{RemovalReason, RoomEvent};
use huddle_types::models::{ParticipantStatus, Tier, normalize_share_code};
use huddle_types::tiers::limits_for;
use huddle_usage::LimitChecker;

use crate::ai::AiProvider;
use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

/// Room policy knobs read from the environment at startup.
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    pub room_ttl_hours: u32,
    pub anonymous_room_limit: u32,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            room_ttl_hours: 24,
            anonymous_room_limit: 1,
        }
    }
}

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub limits: LimitChecker,
    pub jwt_secret: String,
    pub settings: RoomSettings,
    pub ai: Option<Arc<dyn AiProvider>>,
}

impl AppStateInner {
    /// Run a blocking DB closure off the async runtime.
    pub async fn db<F, T>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
    }

    pub async fn room(&self, share_code: &str) -> Result<RoomRow, ApiError> {
        let code = normalize_share_code(share_code);
        self.db(move |db| db.get_room_by_share_code(&code))
            .await?
            .ok_or(ApiError::NotFound("room"))
    }

    /// Like `room`, but expired rooms are refused for new activity. The
    /// caller's clients are told the room is gone.
    pub async fn open_room(&self, share_code: &str, session_id: &str) -> Result<RoomRow, ApiError> {
        let room = self.room(share_code).await?;
        if Utc::now() > room.expires_at {
            self.dispatcher.broadcast_to_room(RoomEvent::UserRemovedFromRoom {
                share_code: room.share_code.clone(),
                session_id: session_id.to_string(),
                reason: RemovalReason::RoomExpired,
            });
            return Err(ApiError::RoomExpired);
        }
        Ok(room)
    }

    /// Display name of an active participant, or 403.
    pub async fn require_member(&self, room: &RoomRow, session_id: &str) -> Result<String, ApiError> {
        let room_id = room.id.clone();
        let session = session_id.to_string();
        let participant = self
            .db(move |db| db.get_participant(&room_id, &session))
            .await?
            .ok_or(ApiError::Forbidden("not_a_participant"))?;

        match participant.status()? {
            ParticipantStatus::Active => Ok(participant.display_name),
            ParticipantStatus::Removed => Err(ApiError::Forbidden("REMOVED_FROM_ROOM")),
            ParticipantStatus::Left => Err(ApiError::Forbidden("not_a_participant")),
        }
    }

    /// 404 unless the thread belongs to the room; 409 once it holds the
    /// tier's message cap.
    pub async fn ensure_thread_has_room(
        &self,
        room: &RoomRow,
        thread_id: Uuid,
        tier: Tier,
    ) -> Result<(), ApiError> {
        let room_id = room.id.clone();
        let tid = thread_id.to_string();
        let count = self
            .db(move |db| match db.get_thread(&tid)? {
                Some(thread) if thread.room_id == room_id => Ok(Some(db.count_thread_messages(&tid)?)),
                _ => Ok(None),
            })
            .await?
            .ok_or(ApiError::NotFound("thread"))?;

        let cap = limits_for(tier).thread_message_cap;
        if count >= cap {
            return Err(ApiError::ThreadFull { cap });
        }
        Ok(())
    }
}
