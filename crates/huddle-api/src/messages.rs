use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use huddle_db::queries::NewMessage;
use huddle_types::api::SendMessageRequest;
use huddle_types::events::RoomEvent;
use huddle_types::models::{ChatMessage, UsageResource};

use crate::error::ApiError;
use crate::identity::Caller;
use crate::state::AppState;

const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Only messages created after this instant (missed-message catch-up).
    pub since: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    50
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    caller: Caller,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() || content.chars().count() > MAX_MESSAGE_LEN {
        return Err(ApiError::bad_request("message must be 1-4000 characters"));
    }

    let session_id = caller.session_id();
    let room = state.open_room(&share_code, &session_id).await?;
    let sender_name = state.require_member(&room, &session_id).await?;
    let tier = room.tier()?;

    if let Some(thread_id) = req.thread_id {
        state.ensure_thread_has_room(&room, thread_id, tier).await?;
    }

    let check = state
        .limits
        .check_resource(&room.id, tier, UsageResource::Messages)
        .await;
    if !check.allowed {
        return Err(ApiError::Quota {
            resource: UsageResource::Messages,
            check,
        });
    }

    let message = ChatMessage {
        id: Uuid::new_v4(),
        room_id: room.room_id()?,
        thread_id: req.thread_id,
        sender_session: session_id,
        sender_name,
        content,
        is_ai: false,
        created_at: Utc::now(),
    };

    {
        let m = message.clone();
        state
            .db(move |db| {
                db.insert_message(&NewMessage {
                    id: &m.id.to_string(),
                    room_id: &m.room_id.to_string(),
                    thread_id: m.thread_id.map(|t| t.to_string()).as_deref(),
                    sender_session: &m.sender_session,
                    sender_name: &m.sender_name,
                    content: &m.content,
                    is_ai: false,
                    created_at: m.created_at,
                })
            })
            .await?;
    }

    // The message is already stored; a failed count only under-bills
    if let Err(e) = state.limits.store().record(&room.id, UsageResource::Messages).await {
        warn!("Failed to record message usage for room {}: {}", room.id, e);
    }

    state.dispatcher.broadcast_to_room(RoomEvent::RoomMessageCreated {
        share_code: room.share_code.clone(),
        id: message.id,
        thread_id: message.thread_id,
        sender_session: message.sender_session.clone(),
        sender_name: message.sender_name.clone(),
        content: message.content.clone(),
        is_ai: false,
        created_at: message.created_at,
    });

    Ok((StatusCode::CREATED, Json(message)))
}

/// History stays readable after the room expires.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    Query(query): Query<MessageQuery>,
    caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    let room = state.room(&share_code).await?;
    state.require_member(&room, &caller.session_id()).await?;

    let room_id = room.id.clone();
    let limit = query.limit.clamp(1, 200);
    let since = query.since;
    let messages = state
        .db(move |db| {
            db.get_messages(&room_id, since, limit)?
                .into_iter()
                .map(|row| row.into_message())
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await?;

    Ok(Json(messages))
}
