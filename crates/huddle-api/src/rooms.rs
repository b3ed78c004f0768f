use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_db::join::{JoinOutcome, JoinRequest};
use huddle_db::models::RoomRow;
use huddle_db::passwords::hash_room_password;
use huddle_db::queries::NewRoom;
use huddle_types::api::{
    CreateRoomRequest, JoinRoomRequest, JoinRoomResponse, SetPasswordRequest, UpgradeTierRequest,
};
use huddle_types::events::{RemovalReason, RoomEvent};
use huddle_types::models::{Room, SHARE_CODE_ALPHABET, SHARE_CODE_LEN, Tier};
use huddle_types::tiers::limits_for;

use crate::error::ApiError;
use crate::identity::{AuthUser, Caller};
use crate::state::AppState;

const MAX_ROOM_NAME_LEN: usize = 100;
const MAX_DISPLAY_NAME_LEN: usize = 50;
const MAX_ROOM_TTL_HOURS: u32 = 24 * 30;
const SHARE_CODE_ATTEMPTS: usize = 10;

fn generate_share_code() -> String {
    let mut rng = rand::rng();
    (0..SHARE_CODE_LEN)
        .map(|_| SHARE_CODE_ALPHABET[rng.random_range(0..SHARE_CODE_ALPHABET.len())] as char)
        .collect()
}

fn require_creator(room: &RoomRow, user: &AuthUser) -> Result<(), ApiError> {
    if room.creator_id == user.user_id.to_string() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("not_room_creator"))
    }
}

fn to_room(row: RoomRow) -> Result<Room, ApiError> {
    Ok(row.into_room(Utc::now())?)
}

pub async fn create_room(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_ROOM_NAME_LEN {
        return Err(ApiError::bad_request("room name must be 1-100 characters"));
    }

    let now = Utc::now();
    let ttl_hours = req
        .ttl_hours
        .unwrap_or(state.settings.room_ttl_hours)
        .clamp(1, MAX_ROOM_TTL_HOURS);

    let password_hash = match req.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            let password = password.to_string();
            Some(tokio::task::spawn_blocking(move || hash_room_password(&password)).await??)
        }
        None => None,
    };
    let password_expires_at = password_hash
        .as_ref()
        .and(req.password_ttl_hours)
        .map(|h| now + Duration::hours(h as i64));

    let tier = Tier::Free;
    let room_id = Uuid::new_v4().to_string();
    let creator_id = user.user_id.to_string();

    let row = state
        .db(move |db| {
            let mut share_code = generate_share_code();
            let mut attempts = 1;
            while db.share_code_exists(&share_code)? {
                if attempts >= SHARE_CODE_ATTEMPTS {
                    anyhow::bail!("could not find a free share code");
                }
                share_code = generate_share_code();
                attempts += 1;
            }

            db.create_room(&NewRoom {
                id: &room_id,
                name: &name,
                share_code: &share_code,
                creator_id: &creator_id,
                tier: tier.as_str(),
                max_participants: limits_for(tier).max_participants,
                created_at: now,
                expires_at: now + Duration::hours(ttl_hours as i64),
                password_hash: password_hash.as_deref(),
                password_expires_at,
            })?;
            db.get_room_by_id(&room_id)?
                .ok_or_else(|| anyhow::anyhow!("room {} vanished after insert", room_id))
        })
        .await?;

    info!("Room {} ({}) created by {}", row.share_code, row.id, user.user_id);
    Ok((StatusCode::CREATED, Json(to_room(row)?)))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state.room(&share_code).await?;
    Ok(Json(to_room(row)?))
}

pub async fn join_room(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    caller: Caller,
    Json(req): Json<JoinRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let display_name = req.display_name.trim().to_string();
    if display_name.is_empty() || display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ApiError::bad_request("display name must be 1-50 characters"));
    }

    if let Some(previous) = req.previous_session_id.as_deref() {
        if !caller.owns_session(previous) {
            warn!("{} tried to claim session {}", caller.session_id(), previous);
            return Err(ApiError::Forbidden("previous_session_not_owned"));
        }
    }

    let row = state.room(&share_code).await?;
    let session_id = caller.session_id();
    let user_id = caller.user_id().map(|id| id.to_string());
    let anonymous_room_limit = state.settings.anonymous_room_limit;

    let (outcome, participants) = {
        let room_id = row.id.clone();
        let session_id = session_id.clone();
        let display_name = display_name.clone();
        let previous = req.previous_session_id.clone();
        let password = req.password.clone();
        state
            .db(move |db| {
                let outcome = db.join_room_safely(&JoinRequest {
                    room_id: &room_id,
                    session_id: &session_id,
                    display_name: &display_name,
                    user_id: user_id.as_deref(),
                    password: password.as_deref(),
                    previous_session_id: previous.as_deref(),
                    anonymous_room_limit: Some(anonymous_room_limit),
                    now: Utc::now(),
                })?;
                let participants = match &outcome {
                    JoinOutcome::Joined { .. } => db
                        .list_active_participants(&room_id)?
                        .into_iter()
                        .map(|p| p.into_participant())
                        .collect::<anyhow::Result<Vec<_>>>()?,
                    JoinOutcome::Rejected(_) => Vec::new(),
                };
                Ok((outcome, participants))
            })
            .await?
    };

    let (rejoined, migration) = match outcome {
        JoinOutcome::Joined { rejoined, migration } => (rejoined, migration),
        JoinOutcome::Rejected(rejection) => {
            info!("{} could not join {}: {}", session_id, row.share_code, rejection.code());
            return Err(ApiError::Join(rejection));
        }
    };

    let code = row.share_code.clone();
    if let Some(m) = &migration {
        state.dispatcher.revoke_room(&m.from_session_id, &code).await;
    }
    state.dispatcher.authorize_room(&session_id, &code).await;
    if !rejoined {
        state.dispatcher.broadcast_to_room(RoomEvent::UserJoinedRoom {
            share_code: code.clone(),
            session_id: session_id.clone(),
            display_name,
        });
    }
    state
        .dispatcher
        .send_to_user(&session_id, RoomEvent::SidebarRefreshRequested { share_code: code })
        .await;

    let tier = row.tier()?;
    Ok(Json(JoinRoomResponse {
        room: to_room(row)?,
        session_id,
        participants,
        limits: *limits_for(tier),
        migration,
    }))
}

pub async fn leave_room(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    let row = state.room(&share_code).await?;
    let session_id = caller.session_id();

    let left = {
        let room_id = row.id.clone();
        let session_id = session_id.clone();
        state
            .db(move |db| {
                let participant = db.get_participant(&room_id, &session_id)?;
                let left = db.leave_room(&room_id, &session_id)?;
                Ok(participant.filter(|_| left))
            })
            .await?
    };

    if let Some(participant) = left {
        info!("{} left room {}", session_id, row.share_code);
        state.dispatcher.revoke_room(&session_id, &row.share_code).await;
        state.dispatcher.activity().remove_session(&row.share_code, &session_id).await;
        state.dispatcher.broadcast_to_room(RoomEvent::UserLeftRoom {
            share_code: row.share_code.clone(),
            session_id,
            display_name: participant.display_name,
        });
        state.dispatcher.publish_activity(&row.share_code).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_room(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let row = state.room(&share_code).await?;
    require_creator(&row, &user)?;

    let cancelled = state.dispatcher.streams().cancel_room(&row.share_code);
    if cancelled > 0 {
        warn!("Deleting room {} with {} AI streams in flight", row.share_code, cancelled);
    }

    // Members' sidebars must drop the room before their authorization is gone
    state
        .dispatcher
        .send_to_members(RoomEvent::SidebarRefreshRequested {
            share_code: row.share_code.clone(),
        })
        .await;

    let room_id = row.id.clone();
    let members = state
        .db(move |db| {
            let members = db.list_active_participants(&room_id)?;
            db.delete_room(&room_id)?;
            Ok(members)
        })
        .await?;
    state.dispatcher.activity().drop_room(&row.share_code).await;

    // Open room pages stop listening; the room is over for everyone
    for member in members {
        state.dispatcher.revoke_room(&member.session_id, &row.share_code).await;
        state.dispatcher.broadcast_to_room(RoomEvent::UserRemovedFromRoom {
            share_code: row.share_code.clone(),
            session_id: member.session_id,
            reason: RemovalReason::RoomExpired,
        });
    }

    info!("Room {} deleted by {}", row.share_code, user.user_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Tiers only go up; payment confirmation happens before this is called.
pub async fn upgrade_tier(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    user: AuthUser,
    Json(req): Json<UpgradeTierRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state.room(&share_code).await?;
    require_creator(&row, &user)?;

    let current = row.tier()?;
    if req.tier <= current {
        return Err(ApiError::bad_request(format!(
            "cannot move from {} to {}",
            current, req.tier
        )));
    }

    let room_id = row.id.clone();
    let tier = req.tier;
    let updated = state
        .db(move |db| {
            db.update_room_tier(&room_id, tier.as_str(), limits_for(tier).max_participants)?;
            db.get_room_by_id(&room_id)?
                .ok_or_else(|| anyhow::anyhow!("room {} vanished during upgrade", room_id))
        })
        .await?;

    info!("Room {} upgraded {} -> {}", updated.share_code, current, tier);
    state
        .dispatcher
        .send_to_members(RoomEvent::SidebarRefreshRequested {
            share_code: updated.share_code.clone(),
        })
        .await;
    Ok(Json(to_room(updated)?))
}

pub async fn set_password(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    user: AuthUser,
    Json(req): Json<SetPasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state.room(&share_code).await?;
    require_creator(&row, &user)?;

    let hash = match req.password.filter(|p| !p.is_empty()) {
        Some(password) => Some(tokio::task::spawn_blocking(move || hash_room_password(&password)).await??),
        None => None,
    };
    let expires_at = hash
        .as_ref()
        .and(req.ttl_hours)
        .map(|h| Utc::now() + Duration::hours(h as i64));

    let room_id = row.id.clone();
    let updated = state
        .db(move |db| {
            db.set_room_password(&room_id, hash.as_deref(), expires_at)?;
            db.get_room_by_id(&room_id)?
                .ok_or_else(|| anyhow::anyhow!("room {} vanished during password change", room_id))
        })
        .await?;

    info!(
        "Room {} password {}",
        updated.share_code,
        if updated.password_hash.is_some() { "set" } else { "cleared" }
    );
    Ok(Json(to_room(updated)?))
}

/// Creator removes a participant. The row stays, marked `removed`, so a
/// later join attempt is refused.
pub async fn remove_participant(
    State(state): State<AppState>,
    Path((share_code, session_id)): Path<(String, String)>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let row = state.room(&share_code).await?;
    require_creator(&row, &user)?;

    let room_id = row.id.clone();
    let target = session_id.clone();
    let removed = state
        .db(move |db| db.remove_participant(&room_id, &target))
        .await?;
    if !removed {
        return Err(ApiError::NotFound("participant"));
    }

    info!("{} removed from room {} by {}", session_id, row.share_code, user.user_id);
    state.dispatcher.revoke_room(&session_id, &row.share_code).await;
    state.dispatcher.activity().remove_session(&row.share_code, &session_id).await;
    state.dispatcher.broadcast_to_room(RoomEvent::UserRemovedFromRoom {
        share_code: row.share_code.clone(),
        session_id,
        reason: RemovalReason::Removed,
    });
    state.dispatcher.publish_activity(&row.share_code).await;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_types::models::is_valid_share_code;

    #[test]
    fn generated_share_codes_use_the_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_share_code();
            assert_eq!(code.len(), SHARE_CODE_LEN);
            assert!(is_valid_share_code(&code));
            assert!(!code.contains(['0', 'O', '1', 'I']));
        }
    }
}
