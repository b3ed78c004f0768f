//! Database row types. These map directly to SQLite rows and stay separate
//! from the huddle-types API models; `into_*` converts at the boundary.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use huddle_types::models::{ChatMessage, Participant, ParticipantStatus, Room, Thread, Tier};

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub share_code: String,
    pub creator_id: String,
    pub tier: String,
    pub max_participants: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub password_hash: Option<String>,
    pub password_expires_at: Option<DateTime<Utc>>,
}

impl RoomRow {
    pub fn room_id(&self) -> Result<Uuid> {
        parse_uuid(&self.id, "room id")
    }

    pub fn tier(&self) -> Result<Tier> {
        self.tier.parse().map_err(|e| anyhow!("Room {}: {}", self.id, e))
    }

    /// A password only guards the room until its expiration passes.
    pub fn password_active(&self, now: DateTime<Utc>) -> bool {
        self.password_hash.is_some() && self.password_expires_at.is_none_or(|exp| now <= exp)
    }

    pub fn into_room(self, now: DateTime<Utc>) -> Result<Room> {
        let has_password = self.password_active(now);
        Ok(Room {
            id: self.room_id()?,
            tier: self.tier()?,
            creator_id: parse_uuid(&self.creator_id, "creator id")?,
            name: self.name,
            share_code: self.share_code,
            max_participants: self.max_participants,
            created_at: self.created_at,
            expires_at: self.expires_at,
            has_password,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub room_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub display_name: String,
    pub status: String,
    pub joined_at: DateTime<Utc>,
}

impl ParticipantRow {
    pub fn status(&self) -> Result<ParticipantStatus> {
        self.status
            .parse()
            .map_err(|e| anyhow!("Participant {}: {}", self.session_id, e))
    }

    pub fn into_participant(self) -> Result<Participant> {
        let user_id = match &self.user_id {
            Some(id) => Some(parse_uuid(id, "participant user id")?),
            None => None,
        };
        Ok(Participant {
            session_id: self.session_id,
            user_id,
            display_name: self.display_name,
            joined_at: self.joined_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ThreadRow {
    pub id: String,
    pub room_id: String,
    pub title: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ThreadRow {
    pub fn into_thread(self) -> Result<Thread> {
        Ok(Thread {
            id: parse_uuid(&self.id, "thread id")?,
            room_id: parse_uuid(&self.room_id, "thread room id")?,
            title: self.title,
            created_by: self.created_by,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub thread_id: Option<String>,
    pub sender_session: String,
    pub sender_name: String,
    pub content: String,
    pub is_ai: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    pub fn into_message(self) -> Result<ChatMessage> {
        let thread_id = match &self.thread_id {
            Some(id) => Some(parse_uuid(id, "message thread id")?),
            None => None,
        };
        Ok(ChatMessage {
            id: parse_uuid(&self.id, "message id")?,
            room_id: parse_uuid(&self.room_id, "message room id")?,
            thread_id,
            sender_session: self.sender_session,
            sender_name: self.sender_name,
            content: self.content,
            is_ai: self.is_ai,
            created_at: self.created_at,
        })
    }
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .map_err(|e| anyhow!("Corrupt {} '{}': {}", what, raw, e))
}
