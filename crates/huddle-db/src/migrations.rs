use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (rooms, participants, threads, messages)");
        conn.execute_batch(
            "
            CREATE TABLE rooms (
                id                  TEXT PRIMARY KEY,
                name                TEXT NOT NULL,
                share_code          TEXT NOT NULL UNIQUE,
                creator_id          TEXT NOT NULL,
                tier                TEXT NOT NULL DEFAULT 'free',
                max_participants    INTEGER NOT NULL,
                created_at          TEXT NOT NULL,
                expires_at          TEXT NOT NULL,
                password_hash       TEXT,
                password_expires_at TEXT
            );

            CREATE TABLE participants (
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                session_id      TEXT NOT NULL,
                user_id         TEXT,
                display_name    TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'active',
                joined_at       TEXT NOT NULL,
                PRIMARY KEY (room_id, session_id)
            );

            CREATE INDEX idx_participants_session
                ON participants(session_id, status);

            CREATE TABLE threads (
                id          TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                title       TEXT NOT NULL,
                created_by  TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_threads_room ON threads(room_id, created_at);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                thread_id       TEXT REFERENCES threads(id) ON DELETE CASCADE,
                sender_session  TEXT NOT NULL,
                sender_name     TEXT NOT NULL,
                content         TEXT NOT NULL,
                is_ai           INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_room ON messages(room_id, created_at);
            CREATE INDEX idx_messages_thread ON messages(thread_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (room usage counters)");
        conn.execute_batch(
            "
            CREATE TABLE room_usage_counters (
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                resource        TEXT NOT NULL,
                period          TEXT NOT NULL,
                period_start    TEXT NOT NULL,
                count           INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (room_id, resource, period, period_start)
            );

            CREATE INDEX idx_usage_period_start
                ON room_usage_counters(period, period_start);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }
}
