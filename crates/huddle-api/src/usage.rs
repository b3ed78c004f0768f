use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use huddle_types::api::UsageResponse;
use huddle_types::tiers::limits_for;

use crate::error::ApiError;
use crate::identity::Caller;
use crate::state::AppState;

/// Current quota standing of a room, for any active participant.
pub async fn get_usage(
    State(state): State<AppState>,
    Path(share_code): Path<String>,
    caller: Caller,
) -> Result<impl IntoResponse, ApiError> {
    let room = state.room(&share_code).await?;
    state.require_member(&room, &caller.session_id()).await?;

    let tier = room.tier()?;
    let usage = state.limits.check_comprehensive(&room.id, tier).await;

    Ok(Json(UsageResponse {
        tier,
        limits: *limits_for(tier),
        usage,
    }))
}
