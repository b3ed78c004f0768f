use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::Database;

impl Database {
    /// Add `amount` to a counter row, creating it on first use. A single
    /// upsert statement, so concurrent increments never lose updates.
    pub fn increment_usage_counter(
        &self,
        room_id: &str,
        resource: &str,
        period: &str,
        period_start: DateTime<Utc>,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "INSERT INTO room_usage_counters
                     (room_id, resource, period, period_start, count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (room_id, resource, period, period_start)
                 DO UPDATE SET count = count + excluded.count, updated_at = excluded.updated_at
                 RETURNING count",
                params![room_id, resource, period, period_start, amount as i64, now],
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Current count for one window; a missing row reads as zero.
    pub fn get_usage_counter(
        &self,
        room_id: &str,
        resource: &str,
        period: &str,
        period_start: DateTime<Utc>,
    ) -> Result<u64> {
        self.with_conn(|conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT count FROM room_usage_counters
                     WHERE room_id = ?1 AND resource = ?2 AND period = ?3 AND period_start = ?4",
                    params![room_id, resource, period, period_start],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0) as u64)
        })
    }

    /// Delete rows whose window started before the cutoff for their period.
    pub fn cleanup_usage_counters(&self, cutoffs: &[(&str, DateTime<Utc>)]) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            for (period, cutoff) in cutoffs {
                deleted += tx.execute(
                    "DELETE FROM room_usage_counters WHERE period = ?1 AND period_start < ?2",
                    params![period, cutoff],
                )?;
            }
            tx.commit()?;
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::tests::seed_room;
    use chrono::{Duration, TimeZone};

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, 0, 0).unwrap()
    }

    #[test]
    fn missing_counter_reads_zero() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 3);
        assert_eq!(db.get_usage_counter(&room, "messages", "hour", hour(9)).unwrap(), 0);
    }

    #[test]
    fn increments_accumulate_within_a_window() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 3);
        let now = hour(9) + Duration::minutes(5);

        assert_eq!(db.increment_usage_counter(&room, "messages", "hour", hour(9), 1, now).unwrap(), 1);
        assert_eq!(db.increment_usage_counter(&room, "messages", "hour", hour(9), 2, now).unwrap(), 3);
        assert_eq!(db.get_usage_counter(&room, "messages", "hour", hour(9)).unwrap(), 3);

        // A new period start is a fresh row
        assert_eq!(db.increment_usage_counter(&room, "messages", "hour", hour(10), 1, now).unwrap(), 1);
        assert_eq!(db.get_usage_counter(&room, "messages", "hour", hour(9)).unwrap(), 3);
    }

    #[test]
    fn concurrent_increments_do_not_lose_updates() {
        let db = std::sync::Arc::new(Database::open_in_memory().unwrap());
        let (room, _) = seed_room(&db, 3);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                let room = room.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        db.increment_usage_counter(&room, "ai_responses", "day", hour(0), 1, hour(1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(db.get_usage_counter(&room, "ai_responses", "day", hour(0)).unwrap(), 200);
    }

    #[test]
    fn cleanup_removes_only_elapsed_windows() {
        let db = Database::open_in_memory().unwrap();
        let (room, _) = seed_room(&db, 3);
        let now = hour(12);

        db.increment_usage_counter(&room, "messages", "hour", hour(10), 1, now).unwrap();
        db.increment_usage_counter(&room, "messages", "hour", hour(12), 1, now).unwrap();
        db.increment_usage_counter(&room, "messages", "day", hour(0), 1, now).unwrap();

        let deleted = db
            .cleanup_usage_counters(&[("hour", hour(12)), ("day", hour(0))])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.get_usage_counter(&room, "messages", "hour", hour(10)).unwrap(), 0);
        assert_eq!(db.get_usage_counter(&room, "messages", "hour", hour(12)).unwrap(), 1);
        assert_eq!(db.get_usage_counter(&room, "messages", "day", hour(0)).unwrap(), 1);
    }
}
