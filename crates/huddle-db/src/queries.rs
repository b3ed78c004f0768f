use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::Database;
use crate::models::{MessageRow, ParticipantRow, RoomRow, ThreadRow};

const ROOM_COLUMNS: &str = "id, name, share_code, creator_id, tier, max_participants, \
     created_at, expires_at, password_hash, password_expires_at";

const PARTICIPANT_COLUMNS: &str = "room_id, session_id, user_id, display_name, status, joined_at";

const MESSAGE_COLUMNS: &str =
    "id, room_id, thread_id, sender_session, sender_name, content, is_ai, created_at";

/// Fields needed to insert a room.
pub struct NewRoom<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub share_code: &'a str,
    pub creator_id: &'a str,
    pub tier: &'a str,
    pub max_participants: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub password_hash: Option<&'a str>,
    pub password_expires_at: Option<DateTime<Utc>>,
}

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub room_id: &'a str,
    pub thread_id: Option<&'a str>,
    pub sender_session: &'a str,
    pub sender_name: &'a str,
    pub content: &'a str,
    pub is_ai: bool,
    pub created_at: DateTime<Utc>,
}

impl Database {
    // -- Rooms --

    pub fn create_room(&self, room: &NewRoom<'_>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (id, name, share_code, creator_id, tier, max_participants,
                                    created_at, expires_at, password_hash, password_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    room.id,
                    room.name,
                    room.share_code,
                    room.creator_id,
                    room.tier,
                    room.max_participants,
                    room.created_at,
                    room.expires_at,
                    room.password_hash,
                    room.password_expires_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn share_code_exists(&self, share_code: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM rooms WHERE share_code = ?1",
                    [share_code],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn get_room_by_share_code(&self, share_code: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, "share_code", share_code))
    }

    pub fn get_room_by_id(&self, id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, "id", id))
    }

    /// Deletes the room and, through cascades, everything hanging off it.
    pub fn delete_room(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM rooms WHERE id = ?1", [id])? > 0))
    }

    pub fn update_room_tier(&self, id: &str, tier: &str, max_participants: u32) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE rooms SET tier = ?2, max_participants = ?3 WHERE id = ?1",
                params![id, tier, max_participants],
            )?;
            Ok(())
        })
    }

    pub fn set_room_password(
        &self,
        id: &str,
        password_hash: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE rooms SET password_hash = ?2, password_expires_at = ?3 WHERE id = ?1",
                params![id, password_hash, expires_at],
            )?;
            Ok(())
        })
    }

    // -- Participants --

    pub fn list_active_participants(&self, room_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {PARTICIPANT_COLUMNS} FROM participants
                 WHERE room_id = ?1 AND status = 'active'
                 ORDER BY joined_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([room_id], participant_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_participant(&self, room_id: &str, session_id: &str) -> Result<Option<ParticipantRow>> {
        self.with_conn(|conn| query_participant(conn, room_id, session_id))
    }

    /// Active → left. Returns `false` when the session was not active.
    pub fn leave_room(&self, room_id: &str, session_id: &str) -> Result<bool> {
        self.set_participant_status(room_id, session_id, "left")
    }

    /// Active → removed. A removed session cannot silently rejoin.
    pub fn remove_participant(&self, room_id: &str, session_id: &str) -> Result<bool> {
        self.set_participant_status(room_id, session_id, "removed")
    }

    fn set_participant_status(&self, room_id: &str, session_id: &str, status: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE participants SET status = ?3
                 WHERE room_id = ?1 AND session_id = ?2 AND status = 'active'",
                params![room_id, session_id, status],
            )?;
            Ok(changed > 0)
        })
    }

    /// Share codes of unexpired rooms where the session is an active participant.
    pub fn active_share_codes_for_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.share_code FROM participants p
                 JOIN rooms r ON r.id = p.room_id
                 WHERE p.session_id = ?1 AND p.status = 'active' AND r.expires_at >= ?2
                 ORDER BY r.share_code",
            )?;
            let codes = stmt
                .query_map(params![session_id, now], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(codes)
        })
    }

    // -- Threads --

    pub fn create_thread(&self, thread: &ThreadRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (id, room_id, title, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    thread.id,
                    thread.room_id,
                    thread.title,
                    thread.created_by,
                    thread.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<ThreadRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, room_id, title, created_by, created_at FROM threads WHERE id = ?1",
                    [id],
                    thread_from_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn list_threads(&self, room_id: &str) -> Result<Vec<ThreadRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, title, created_by, created_at FROM threads
                 WHERE room_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([room_id], thread_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room_id, thread_id, sender_session, sender_name,
                                       content, is_ai, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.id,
                    msg.room_id,
                    msg.thread_id,
                    msg.sender_session,
                    msg.sender_name,
                    msg.content,
                    msg.is_ai,
                    msg.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Newest `limit` messages of the room, oldest first. With `since`, the
    /// first `limit` messages strictly after it, so catch-up pages forward.
    pub fn get_messages(
        &self,
        room_id: &str,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let Some(since) = since else {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE room_id = ?1
                     ORDER BY created_at DESC
                     LIMIT ?2"
                );
                let mut rows = conn
                    .prepare(&sql)?
                    .query_map(params![room_id, limit], message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.reverse();
                return Ok(rows);
            };

            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1 AND created_at > ?2
                 ORDER BY created_at ASC
                 LIMIT ?3"
            );
            let rows = conn
                .prepare(&sql)?
                .query_map(params![room_id, since, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Newest `limit` messages of one thread (`None` is the main room),
    /// oldest first.
    pub fn get_thread_history(
        &self,
        room_id: &str,
        thread_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1 AND thread_id IS ?2
                 ORDER BY created_at DESC
                 LIMIT ?3"
            );
            let mut rows = conn
                .prepare(&sql)?
                .query_map(params![room_id, thread_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn count_thread_messages(&self, thread_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
                [thread_id],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

pub(crate) fn query_room(conn: &Connection, column: &str, value: &str) -> Result<Option<RoomRow>> {
    let sql = format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE {column} = ?1");
    let row = conn.query_row(&sql, [value], room_from_row).optional()?;
    Ok(row)
}

pub(crate) fn query_participant(
    conn: &Connection,
    room_id: &str,
    session_id: &str,
) -> Result<Option<ParticipantRow>> {
    let sql = format!(
        "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE room_id = ?1 AND session_id = ?2"
    );
    let row = conn
        .query_row(&sql, params![room_id, session_id], participant_from_row)
        .optional()?;
    Ok(row)
}

fn room_from_row(row: &Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        name: row.get(1)?,
        share_code: row.get(2)?,
        creator_id: row.get(3)?,
        tier: row.get(4)?,
        max_participants: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
        password_hash: row.get(8)?,
        password_expires_at: row.get(9)?,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        room_id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        display_name: row.get(3)?,
        status: row.get(4)?,
        joined_at: row.get(5)?,
    })
}

fn thread_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadRow> {
    Ok(ThreadRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        title: row.get(2)?,
        created_by: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        thread_id: row.get(2)?,
        sender_session: row.get(3)?,
        sender_name: row.get(4)?,
        content: row.get(5)?,
        is_ai: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    /// Insert a free-tier room expiring in a day; returns (room id, share code).
    pub(crate) fn seed_room(db: &Database, max_participants: u32) -> (String, String) {
        let id = Uuid::new_v4().to_string();
        let share_code = format!("R{}", &Uuid::new_v4().simple().to_string()[..7]).to_uppercase();
        let now = Utc::now();
        db.create_room(&NewRoom {
            id: &id,
            name: "test room",
            share_code: &share_code,
            creator_id: &Uuid::new_v4().to_string(),
            tier: "free",
            max_participants,
            created_at: now,
            expires_at: now + Duration::hours(24),
            password_hash: None,
            password_expires_at: None,
        })
        .unwrap();
        (id, share_code)
    }

    #[test]
    fn room_lookup_by_share_code_and_id() {
        let db = Database::open_in_memory().unwrap();
        let (id, code) = seed_room(&db, 3);

        let by_code = db.get_room_by_share_code(&code).unwrap().unwrap();
        assert_eq!(by_code.id, id);
        assert!(db.get_room_by_id(&id).unwrap().is_some());
        assert!(db.get_room_by_share_code("NOPE1234").unwrap().is_none());
        assert!(db.share_code_exists(&code).unwrap());
    }

    fn insert_at(db: &Database, room_id: &str, thread_id: Option<&str>, content: &str, at: DateTime<Utc>) {
        let id = Uuid::new_v4().to_string();
        db.insert_message(&NewMessage {
            id: &id,
            room_id,
            thread_id,
            sender_session: "anon_aa",
            sender_name: "aa",
            content,
            is_ai: false,
            created_at: at,
        })
        .unwrap();
    }

    fn contents(rows: &[MessageRow]) -> Vec<&str> {
        rows.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn messages_since_returns_only_newer_rows_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let (room_id, _) = seed_room(&db, 3);
        let base = Utc::now();

        for i in 0..3 {
            insert_at(&db, &room_id, None, &format!("m{}", i), base + Duration::seconds(i));
        }

        let all = db.get_messages(&room_id, None, 50).unwrap();
        assert_eq!(contents(&all), ["m0", "m1", "m2"]);

        let missed = db.get_messages(&room_id, Some(base), 50).unwrap();
        assert_eq!(contents(&missed), ["m1", "m2"]);
    }

    #[test]
    fn catch_up_pages_forward_from_since() {
        let db = Database::open_in_memory().unwrap();
        let (room_id, _) = seed_room(&db, 3);
        let base = Utc::now();

        for i in 0..5 {
            insert_at(&db, &room_id, None, &format!("m{}", i), base + Duration::seconds(i));
        }

        // The oldest missed messages come first, not the newest page
        let first = db.get_messages(&room_id, Some(base), 2).unwrap();
        assert_eq!(contents(&first), ["m1", "m2"]);
        let next = db.get_messages(&room_id, Some(first[1].created_at), 2).unwrap();
        assert_eq!(contents(&next), ["m3", "m4"]);

        let latest = db.get_messages(&room_id, None, 2).unwrap();
        assert_eq!(contents(&latest), ["m3", "m4"]);
    }

    #[test]
    fn thread_history_is_limited_within_the_thread() {
        let db = Database::open_in_memory().unwrap();
        let (room_id, _) = seed_room(&db, 3);
        let thread = ThreadRow {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            title: "side".into(),
            created_by: "anon_aa".into(),
            created_at: Utc::now(),
        };
        db.create_thread(&thread).unwrap();
        let base = Utc::now();

        insert_at(&db, &room_id, Some(&thread.id), "t0", base);
        insert_at(&db, &room_id, Some(&thread.id), "t1", base + Duration::seconds(1));
        for i in 0..5 {
            insert_at(&db, &room_id, None, &format!("m{}", i), base + Duration::seconds(2 + i));
        }

        let in_thread = db.get_thread_history(&room_id, Some(&thread.id), 3).unwrap();
        assert_eq!(contents(&in_thread), ["t0", "t1"]);

        let main = db.get_thread_history(&room_id, None, 3).unwrap();
        assert_eq!(contents(&main), ["m2", "m3", "m4"]);
    }

    #[test]
    fn deleting_a_room_cascades() {
        let db = Database::open_in_memory().unwrap();
        let (room_id, _) = seed_room(&db, 3);
        let thread = ThreadRow {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            title: "t".into(),
            created_by: "anon_aa".into(),
            created_at: Utc::now(),
        };
        db.create_thread(&thread).unwrap();

        assert!(db.delete_room(&room_id).unwrap());
        assert!(db.get_thread(&thread.id).unwrap().is_none());
        assert!(!db.delete_room(&room_id).unwrap());
    }
}
