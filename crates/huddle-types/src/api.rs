use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Migration, Participant, Room, Tier};
use crate::tiers::TierLimits;

// -- JWT Claims --

/// Claims issued by the identity provider. Shared by the REST middleware and
/// the gateway's identify handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub name: String,
    pub password: Option<String>,
    pub password_ttl_hours: Option<u32>,
    pub ttl_hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinRoomRequest {
    pub display_name: String,
    pub password: Option<String>,
    pub previous_session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRoomResponse {
    pub room: Room,
    pub session_id: String,
    pub participants: Vec<Participant>,
    pub limits: TierLimits,
    pub migration: Option<Migration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpgradeTierRequest {
    pub tier: Tier,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetPasswordRequest {
    /// `None` clears the password.
    pub password: Option<String>,
    pub ttl_hours: Option<u32>,
}

// -- Messages and threads --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    pub thread_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateThreadRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiRequest {
    pub prompt: String,
}

// -- Usage --

/// Outcome of one quota check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub allowed: bool,
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComprehensiveUsage {
    pub messages: LimitCheck,
    pub ai_responses: LimitCheck,
    pub reasoning_messages: LimitCheck,
    pub threads: LimitCheck,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    pub tier: Tier,
    pub limits: TierLimits,
    pub usage: ComprehensiveUsage,
}
