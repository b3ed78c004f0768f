use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of generated share codes.
pub const SHARE_CODE_LEN: usize = 8;

/// Share code alphabet: uppercase alphanumerics minus 0/O/1/I.
pub const SHARE_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Share codes are accepted case-insensitively and stored uppercase.
pub fn normalize_share_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn is_valid_share_code(code: &str) -> bool {
    (4..=16).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_alphanumeric())
}

// -- Tiers --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Basic, Tier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "premium" => Ok(Tier::Premium),
            other => Err(ParseError::Tier(other.to_string())),
        }
    }
}

// -- Usage keys --

/// Billable resources tracked per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageResource {
    Messages,
    AiResponses,
    ReasoningMessages,
    Threads,
}

impl UsageResource {
    pub const ALL: [UsageResource; 4] = [
        UsageResource::Messages,
        UsageResource::AiResponses,
        UsageResource::ReasoningMessages,
        UsageResource::Threads,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageResource::Messages => "messages",
            UsageResource::AiResponses => "ai_responses",
            UsageResource::ReasoningMessages => "reasoning_messages",
            UsageResource::Threads => "threads",
        }
    }
}

impl fmt::Display for UsageResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageResource {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UsageResource::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ParseError::Resource(s.to_string()))
    }
}

/// Counter window granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePeriod {
    Hour,
    Day,
    Month,
}

impl UsagePeriod {
    pub const ALL: [UsagePeriod; 3] = [UsagePeriod::Hour, UsagePeriod::Day, UsagePeriod::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsagePeriod::Hour => "hour",
            UsagePeriod::Day => "day",
            UsagePeriod::Month => "month",
        }
    }
}

impl fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsagePeriod {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UsagePeriod::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ParseError::Period(s.to_string()))
    }
}

/// Map key used by batched reads: `"<resource>_<period>"`.
pub fn usage_key(resource: UsageResource, period: UsagePeriod) -> String {
    format!("{}_{}", resource.as_str(), period.as_str())
}

// -- Sessions --

/// Identity a participant joins under.
///
/// Signed-in users are `auth_<userId>`; anonymous sessions are `anon_<hex>`
/// derived from the client address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SessionId {
    User(Uuid),
    Anonymous(String),
}

impl SessionId {
    pub fn from_address(addr: &str) -> Self {
        let digest = Sha256::digest(addr.as_bytes());
        SessionId::Anonymous(hex::encode(&digest[..8]))
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            SessionId::User(id) => Some(*id),
            SessionId::Anonymous(_) => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, SessionId::Anonymous(_))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::User(id) => write!(f, "auth_{}", id),
            SessionId::Anonymous(token) => write!(f, "anon_{}", token),
        }
    }
}

impl FromStr for SessionId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("auth_") {
            let id = rest
                .parse::<Uuid>()
                .map_err(|_| ParseError::Session(s.to_string()))?;
            return Ok(SessionId::User(id));
        }
        if let Some(rest) = s.strip_prefix("anon_") {
            if !rest.is_empty() && rest.len() <= 64 && rest.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Ok(SessionId::Anonymous(rest.to_string()));
            }
        }
        Err(ParseError::Session(s.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown tier: {0}")]
    Tier(String),
    #[error("unknown usage resource: {0}")]
    Resource(String),
    #[error("unknown usage period: {0}")]
    Period(String),
    #[error("malformed session id: {0}")]
    Session(String),
    #[error("unknown participant status: {0}")]
    Status(String),
}

// -- Rooms --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub share_code: String,
    pub creator_id: Uuid,
    pub tier: Tier,
    pub max_participants: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub has_password: bool,
}

impl Room {
    /// Expired rooms keep their history but accept no new activity.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Left,
    Removed,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Active => "active",
            ParticipantStatus::Left => "left",
            ParticipantStatus::Removed => "removed",
        }
    }
}

impl FromStr for ParticipantStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ParticipantStatus::Active),
            "left" => Ok(ParticipantStatus::Left),
            "removed" => Ok(ParticipantStatus::Removed),
            other => Err(ParseError::Status(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: String,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub room_id: Uuid,
    pub title: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub sender_session: String,
    pub sender_name: String,
    pub content: String,
    pub is_ai: bool,
    pub created_at: DateTime<Utc>,
}

/// Reported when an anonymous session's history was reattached on rejoin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub from_session_id: String,
    pub to_session_id: String,
    pub messages_migrated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_roundtrips_through_string() {
        let user = Uuid::new_v4();
        let session: SessionId = format!("auth_{}", user).parse().unwrap();
        assert_eq!(session, SessionId::User(user));
        assert_eq!(session.to_string(), format!("auth_{}", user));

        let anon: SessionId = "anon_deadbeef".parse().unwrap();
        assert!(anon.is_anonymous());
        assert_eq!(anon.user_id(), None);
    }

    #[test]
    fn session_id_rejects_garbage() {
        assert!("auth_not-a-uuid".parse::<SessionId>().is_err());
        assert!("anon_".parse::<SessionId>().is_err());
        assert!("anon_../../etc".parse::<SessionId>().is_err());
        assert!("user_123".parse::<SessionId>().is_err());
    }

    #[test]
    fn anonymous_session_is_stable_per_address() {
        let a = SessionId::from_address("203.0.113.7");
        let b = SessionId::from_address("203.0.113.7");
        let c = SessionId::from_address("203.0.113.8");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), "anon_".len() + 16);
    }

    #[test]
    fn usage_key_format() {
        assert_eq!(usage_key(UsageResource::Messages, UsagePeriod::Hour), "messages_hour");
        assert_eq!(
            usage_key(UsageResource::ReasoningMessages, UsagePeriod::Day),
            "reasoning_messages_day"
        );
    }

    #[test]
    fn share_code_validation() {
        assert!(is_valid_share_code("ABCD2345"));
        assert!(!is_valid_share_code("AB"));
        assert!(!is_valid_share_code("ABCD-2345"));
        assert_eq!(normalize_share_code(" abcd2345 "), "ABCD2345");
    }
}
