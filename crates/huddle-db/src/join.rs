//! Atomic room join.
//!
//! The whole join runs inside one `IMMEDIATE` transaction: password check,
//! removal guard, capacity check, identity migration and the participant
//! upsert either all happen or none do. Callers must never count participants
//! and insert separately; this function is the only place capacity is decided.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior, params};
use serde_json::json;
use tracing::{debug, info};

use huddle_types::models::{Migration, ParticipantStatus, SessionId};

use crate::Database;
use crate::passwords::verify_room_password;
use crate::queries::{query_participant, query_room};

/// Parameters of one join attempt.
#[derive(Debug, Clone)]
pub struct JoinRequest<'a> {
    pub room_id: &'a str,
    pub session_id: &'a str,
    pub display_name: &'a str,
    pub user_id: Option<&'a str>,
    pub password: Option<&'a str>,
    pub previous_session_id: Option<&'a str>,
    /// Max rooms an anonymous session may be active in at once.
    pub anonymous_room_limit: Option<u32>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinRejection {
    RoomNotFound,
    RoomExpired,
    InvalidPassword,
    RemovedFromRoom,
    RoomFull,
    AnonymousRoomLimit { current_room_count: u32 },
}

impl JoinRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "room_not_found",
            Self::RoomExpired => "room_expired",
            Self::InvalidPassword => "invalid_password",
            Self::RemovedFromRoom => "REMOVED_FROM_ROOM",
            Self::RoomFull => "room_full",
            Self::AnonymousRoomLimit { .. } => "anonymous_room_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined {
        /// The session already held an active seat; nothing was counted twice.
        rejoined: bool,
        migration: Option<Migration>,
    },
    Rejected(JoinRejection),
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined { .. })
    }

    /// The `{success, error?, migration?}` shape other datastore
    /// implementations of this contract return.
    pub fn to_rpc_json(&self) -> serde_json::Value {
        match self {
            Self::Joined { migration, .. } => match migration {
                Some(m) => json!({
                    "success": true,
                    "migration": {
                        "from_session_id": m.from_session_id,
                        "to_session_id": m.to_session_id,
                        "messages_migrated": m.messages_migrated,
                    }
                }),
                None => json!({ "success": true }),
            },
            Self::Rejected(JoinRejection::AnonymousRoomLimit { current_room_count }) => json!({
                "success": false,
                "error": "anonymous_room_limit",
                "current_room_count": current_room_count,
            }),
            Self::Rejected(r) => json!({ "success": false, "error": r.code() }),
        }
    }
}

impl Database {
    pub fn join_room_safely(&self, req: &JoinRequest<'_>) -> Result<JoinOutcome> {
        self.with_conn_mut(|conn| join_in_transaction(conn, req))
    }
}

fn join_in_transaction(conn: &mut Connection, req: &JoinRequest<'_>) -> Result<JoinOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let outcome = evaluate_and_apply(&tx, req)?;

    match &outcome {
        JoinOutcome::Joined { .. } => tx.commit()?,
        // Nothing was written; dropping the transaction rolls back
        JoinOutcome::Rejected(reason) => {
            debug!(
                "Join of {} to room {} rejected: {}",
                req.session_id,
                req.room_id,
                reason.code()
            );
        }
    }

    Ok(outcome)
}

fn evaluate_and_apply(conn: &Connection, req: &JoinRequest<'_>) -> Result<JoinOutcome> {
    use JoinRejection::*;

    let room = query_room(conn, "id", req.room_id)?;
    let Some(room) = room else {
        return Ok(JoinOutcome::Rejected(RoomNotFound));
    };
    if req.now > room.expires_at {
        return Ok(JoinOutcome::Rejected(RoomExpired));
    }

    let existing = query_participant(conn, req.room_id, req.session_id)?;
    let existing_status = existing.as_ref().map(|p| p.status()).transpose()?;
    if existing_status == Some(ParticipantStatus::Removed) {
        return Ok(JoinOutcome::Rejected(RemovedFromRoom));
    }
    let already_active = existing_status == Some(ParticipantStatus::Active);

    // Only an anonymous history may be reattached, and only to a signed-in user.
    let previous = req
        .previous_session_id
        .filter(|prev| *prev != req.session_id)
        .filter(|prev| is_migratable(prev, req.session_id));
    let previous_row = match previous {
        Some(prev) => query_participant(conn, req.room_id, prev)?,
        None => None,
    };
    let previous_status = previous_row.as_ref().map(|p| p.status()).transpose()?;
    if previous_status == Some(ParticipantStatus::Removed) {
        return Ok(JoinOutcome::Rejected(RemovedFromRoom));
    }
    let previous_active = previous_status == Some(ParticipantStatus::Active);

    if !already_active && room.password_active(req.now) {
        let hash = room.password_hash.as_deref().unwrap_or_default();
        let supplied = req.password.unwrap_or_default();
        if !verify_room_password(supplied, hash)? {
            return Ok(JoinOutcome::Rejected(InvalidPassword));
        }
    }

    let takes_new_seat = !already_active && !previous_active;
    if takes_new_seat {
        let active: u32 = conn.query_row(
            "SELECT COUNT(*) FROM participants WHERE room_id = ?1 AND status = 'active'",
            [req.room_id],
            |r| r.get(0),
        )?;
        if active >= room.max_participants {
            return Ok(JoinOutcome::Rejected(RoomFull));
        }

        if let Some(limit) = anonymous_limit_for(req) {
            let current: u32 = conn.query_row(
                "SELECT COUNT(*) FROM participants p
                 JOIN rooms r ON r.id = p.room_id
                 WHERE p.session_id = ?1 AND p.status = 'active'
                   AND p.room_id != ?2 AND r.expires_at >= ?3",
                params![req.session_id, req.room_id, req.now],
                |r| r.get(0),
            )?;
            if current >= limit {
                return Ok(JoinOutcome::Rejected(AnonymousRoomLimit {
                    current_room_count: current,
                }));
            }
        }
    }

    let migration = match previous {
        Some(prev) => migrate_session(conn, req, prev, previous_row.is_some(), existing.is_some())?,
        None => None,
    };

    conn.execute(
        "INSERT INTO participants (room_id, session_id, user_id, display_name, status, joined_at)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5)
         ON CONFLICT (room_id, session_id) DO UPDATE SET
             user_id = excluded.user_id,
             display_name = excluded.display_name,
             status = 'active',
             joined_at = excluded.joined_at",
        params![
            req.room_id,
            req.session_id,
            req.user_id,
            req.display_name,
            req.now
        ],
    )?;

    if already_active {
        debug!("{} rejoined room {}", req.session_id, req.room_id);
    } else {
        info!("{} joined room {}", req.session_id, req.room_id);
    }

    Ok(JoinOutcome::Joined {
        rejoined: already_active,
        migration,
    })
}

fn is_migratable(previous: &str, current: &str) -> bool {
    matches!(
        (previous.parse::<SessionId>(), current.parse::<SessionId>()),
        (Ok(SessionId::Anonymous(_)), Ok(SessionId::User(_)))
    )
}

fn anonymous_limit_for(req: &JoinRequest<'_>) -> Option<u32> {
    let anonymous = req
        .session_id
        .parse::<SessionId>()
        .map(|s| s.is_anonymous())
        .unwrap_or(false);
    if anonymous { req.anonymous_room_limit } else { None }
}

/// Move the previous session's seat and messages in this room to the new session.
fn migrate_session(
    conn: &Connection,
    req: &JoinRequest<'_>,
    previous: &str,
    previous_has_row: bool,
    current_has_row: bool,
) -> Result<Option<Migration>> {
    let moved = conn.execute(
        "UPDATE messages SET sender_session = ?3 WHERE room_id = ?1 AND sender_session = ?2",
        params![req.room_id, previous, req.session_id],
    )?;

    if previous_has_row {
        if current_has_row {
            conn.execute(
                "DELETE FROM participants WHERE room_id = ?1 AND session_id = ?2",
                params![req.room_id, previous],
            )?;
        } else {
            conn.execute(
                "UPDATE participants SET session_id = ?3 WHERE room_id = ?1 AND session_id = ?2",
                params![req.room_id, previous, req.session_id],
            )?;
        }
    }

    if !previous_has_row && moved == 0 {
        return Ok(None);
    }

    info!(
        "Migrated {} ({} messages) to {} in room {}",
        previous, moved, req.session_id, req.room_id
    );
    Ok(Some(Migration {
        from_session_id: previous.to_string(),
        to_session_id: req.session_id.to_string(),
        messages_migrated: moved as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passwords::hash_room_password;
    use crate::queries::NewMessage;
    use crate::queries::tests::seed_room;
    use chrono::Duration;
    use std::sync::Arc;
    use uuid::Uuid;

    fn request<'a>(room_id: &'a str, session_id: &'a str) -> JoinRequest<'a> {
        JoinRequest {
            room_id,
            session_id,
            display_name: "guest",
            user_id: None,
            password: None,
            previous_session_id: None,
            anonymous_room_limit: None,
            now: Utc::now(),
        }
    }

    fn active_count(db: &Database, room_id: &str) -> usize {
        db.list_active_participants(room_id).unwrap().len()
    }

    #[test]
    fn join_then_full() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 2);

        assert!(db.join_room_safely(&request(&room, "anon_a1")).unwrap().is_joined());
        assert!(db.join_room_safely(&request(&room, "anon_a2")).unwrap().is_joined());
        assert_eq!(
            db.join_room_safely(&request(&room, "anon_a3")).unwrap(),
            JoinOutcome::Rejected(JoinRejection::RoomFull)
        );
        assert_eq!(active_count(&db, &room), 2);
    }

    #[test]
    fn concurrent_joins_never_exceed_capacity() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (room, _) = seed_room(&db, 3);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let db = db.clone();
                let room = room.clone();
                std::thread::spawn(move || {
                    let session = format!("anon_c{}", i);
                    db.join_room_safely(&request(&room, &session)).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<JoinOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let joined = outcomes.iter().filter(|o| o.is_joined()).count();
        let full = outcomes
            .iter()
            .filter(|o| **o == JoinOutcome::Rejected(JoinRejection::RoomFull))
            .count();
        assert_eq!(joined, 3);
        assert_eq!(full, 7);
        assert_eq!(active_count(&db, &room), 3);
    }

    #[test]
    fn rejoin_is_idempotent_even_when_full() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 1);

        assert!(db.join_room_safely(&request(&room, "anon_r1")).unwrap().is_joined());
        let mut again = request(&room, "anon_r1");
        again.display_name = "renamed";
        assert_eq!(
            db.join_room_safely(&again).unwrap(),
            JoinOutcome::Joined { rejoined: true, migration: None }
        );

        let participants = db.list_active_participants(&room).unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].display_name, "renamed");
    }

    #[test]
    fn removed_session_cannot_rejoin() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 3);

        db.join_room_safely(&request(&room, "anon_x1")).unwrap();
        assert!(db.remove_participant(&room, "anon_x1").unwrap());

        let outcome = db.join_room_safely(&request(&room, "anon_x1")).unwrap();
        assert_eq!(outcome, JoinOutcome::Rejected(JoinRejection::RemovedFromRoom));
        assert_eq!(outcome.to_rpc_json()["error"], "REMOVED_FROM_ROOM");
    }

    #[test]
    fn left_session_may_rejoin() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 1);

        db.join_room_safely(&request(&room, "anon_l1")).unwrap();
        assert!(db.leave_room(&room, "anon_l1").unwrap());
        assert!(db.join_room_safely(&request(&room, "anon_l2")).unwrap().is_joined());
        assert_eq!(
            db.join_room_safely(&request(&room, "anon_l1")).unwrap(),
            JoinOutcome::Rejected(JoinRejection::RoomFull)
        );
    }

    #[test]
    fn password_is_checked_until_it_expires() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 5);
        let hash = hash_room_password("letmein").unwrap();
        let expires = Utc::now() + Duration::hours(1);
        db.set_room_password(&room, Some(&hash), Some(expires)).unwrap();

        let mut wrong = request(&room, "anon_p1");
        wrong.password = Some("nope");
        assert_eq!(
            db.join_room_safely(&wrong).unwrap(),
            JoinOutcome::Rejected(JoinRejection::InvalidPassword)
        );
        assert_eq!(
            db.join_room_safely(&request(&room, "anon_p1")).unwrap(),
            JoinOutcome::Rejected(JoinRejection::InvalidPassword)
        );

        let mut right = request(&room, "anon_p1");
        right.password = Some("letmein");
        assert!(db.join_room_safely(&right).unwrap().is_joined());

        let mut later = request(&room, "anon_p2");
        later.now = expires + Duration::minutes(1);
        assert!(db.join_room_safely(&later).unwrap().is_joined());
    }

    #[test]
    fn expired_and_unknown_rooms_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 3);

        let mut late = request(&room, "anon_e1");
        late.now = Utc::now() + Duration::hours(25);
        assert_eq!(
            db.join_room_safely(&late).unwrap(),
            JoinOutcome::Rejected(JoinRejection::RoomExpired)
        );

        let missing = Uuid::new_v4().to_string();
        assert_eq!(
            db.join_room_safely(&request(&missing, "anon_e1")).unwrap(),
            JoinOutcome::Rejected(JoinRejection::RoomNotFound)
        );
    }

    #[test]
    fn anonymous_session_limited_to_one_room() {
        let db = Database::open_in_memory().unwrap();
        let (room_a, _) = seed_room(&db, 3);
        let (room_b, _) = seed_room(&db, 3);

        let mut first = request(&room_a, "anon_q1");
        first.anonymous_room_limit = Some(1);
        assert!(db.join_room_safely(&first).unwrap().is_joined());

        let mut second = request(&room_b, "anon_q1");
        second.anonymous_room_limit = Some(1);
        let outcome = db.join_room_safely(&second).unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Rejected(JoinRejection::AnonymousRoomLimit { current_room_count: 1 })
        );
        assert_eq!(outcome.to_rpc_json()["current_room_count"], 1);

        // Signed-in users are not subject to the anonymous limit
        let user = format!("auth_{}", Uuid::new_v4());
        let mut signed_in = request(&room_b, &user);
        signed_in.anonymous_room_limit = Some(1);
        assert!(db.join_room_safely(&signed_in).unwrap().is_joined());
    }

    #[test]
    fn anonymous_history_migrates_to_signed_in_user() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 1);

        db.join_room_safely(&request(&room, "anon_m1")).unwrap();
        for i in 0..2 {
            let id = Uuid::new_v4().to_string();
            let content = format!("hello {}", i);
            db.insert_message(&NewMessage {
                id: &id,
                room_id: &room,
                thread_id: None,
                sender_session: "anon_m1",
                sender_name: "guest",
                content: &content,
                is_ai: false,
                created_at: Utc::now(),
            })
            .unwrap();
        }

        // Room is full, but the migrating session reuses the anonymous seat
        let user_id = Uuid::new_v4();
        let session = format!("auth_{}", user_id);
        let user_id_str = user_id.to_string();
        let mut upgrade = request(&room, &session);
        upgrade.user_id = Some(&user_id_str);
        upgrade.previous_session_id = Some("anon_m1");

        let outcome = db.join_room_safely(&upgrade).unwrap();
        let JoinOutcome::Joined { migration: Some(migration), .. } = outcome else {
            panic!("expected a migration, got {:?}", outcome);
        };
        assert_eq!(migration.messages_migrated, 2);
        assert_eq!(migration.from_session_id, "anon_m1");

        let participants = db.list_active_participants(&room).unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].session_id, session);
        let messages = db.get_messages(&room, None, 10).unwrap();
        assert!(messages.iter().all(|m| m.sender_session == session));
    }

    #[test]
    fn signed_in_history_is_never_migrated() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 3);
        let victim = format!("auth_{}", Uuid::new_v4());
        db.join_room_safely(&request(&room, &victim)).unwrap();

        let attacker = format!("auth_{}", Uuid::new_v4());
        let mut req = request(&room, &attacker);
        req.previous_session_id = Some(&victim);
        assert_eq!(
            db.join_room_safely(&req).unwrap(),
            JoinOutcome::Joined { rejoined: false, migration: None }
        );
        assert!(db.get_participant(&room, &victim).unwrap().is_some());
    }
}
