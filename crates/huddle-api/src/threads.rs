use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_db::models::ThreadRow;
use huddle_types::api::CreateThreadRequest;
use huddle_types::events::RoomEvent;
use huddle_types::models::UsageResource;

use crate::error::ApiError;
use crate::identity::Caller;
use crate::state::AppState;

const MAX_TITLE_LEN: usize = 100;

pub async fn create_thread(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    caller: Caller,
    Json(req): Json<CreateThreadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title.trim().to_string();
    if title.is_empty() || title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::bad_request("thread title must be 1-100 characters"));
    }

    let session_id = caller.session_id();
    let room = state.open_room(&share_code, &session_id).await?;
    state.require_member(&room, &session_id).await?;

    let check = state
        .limits
        .check_resource(&room.id, room.tier()?, UsageResource::Threads)
        .await;
    if !check.allowed {
        return Err(ApiError::Quota {
            resource: UsageResource::Threads,
            check,
        });
    }

    let row = ThreadRow {
        id: Uuid::new_v4().to_string(),
        room_id: room.id.clone(),
        title,
        created_by: session_id,
        created_at: Utc::now(),
    };
    let thread = row.clone().into_thread()?;
    state.db(move |db| db.create_thread(&row)).await?;

    if let Err(e) = state.limits.store().record(&room.id, UsageResource::Threads).await {
        warn!("Failed to record thread usage for room {}: {}", room.id, e);
    }

    info!("Thread {} created in room {}", thread.id, room.share_code);
    state
        .dispatcher
        .send_to_members(RoomEvent::ThreadCreated {
            share_code: room.share_code.clone(),
            thread_id: thread.id,
            title: thread.title.clone(),
            created_by: thread.created_by.clone(),
        })
        .await;

    Ok((StatusCode::CREATED, Json(thread)))
}

pub async fn list_threads(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    let room = state.room(&share_code).await?;
    state.require_member(&room, &caller.session_id()).await?;

    let room_id = room.id.clone();
    let threads = state
        .db(move |db| {
            db.list_threads(&room_id)?
                .into_iter()
                .map(|row| row.into_thread())
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await?;

    Ok(Json(threads))
}
