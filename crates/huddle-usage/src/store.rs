use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use huddle_db::Database;
use huddle_types::models::{UsagePeriod, UsageResource, usage_key};

use crate::period::{cleanup_cutoffs, period_start};

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("usage store query failed: {0}")]
    Store(#[from] anyhow::Error),
    #[error("usage store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Counter storage keyed by (room, resource, period, window start).
///
/// Implementations must make `increment` atomic under concurrent callers;
/// counts never go down except through `cleanup_old`.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Add `amount` to the current window and return the new count.
    async fn increment(
        &self,
        room_id: &str,
        resource: UsageResource,
        period: UsagePeriod,
        amount: u64,
    ) -> Result<u64, UsageError>;

    /// Count for the current window; zero when nothing was recorded yet.
    async fn get(
        &self,
        room_id: &str,
        resource: UsageResource,
        period: UsagePeriod,
    ) -> Result<u64, UsageError>;

    /// Delete rows whose window has fully elapsed.
    async fn cleanup_old(&self) -> Result<usize, UsageError>;

    /// Current time as the store sees it.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Concurrent reads keyed `"<resource>_<period>"`. A failed read is logged
    /// and reported as zero.
    async fn get_multiple(
        &self,
        room_id: &str,
        keys: &[(UsageResource, UsagePeriod)],
    ) -> HashMap<String, u64> {
        let reads = keys.iter().map(|&(resource, period)| async move {
            let count = match self.get(room_id, resource, period).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Usage read {}/{} for room {} failed: {}", resource, period, room_id, e);
                    0
                }
            };
            (usage_key(resource, period), count)
        });
        join_all(reads).await.into_iter().collect()
    }

    /// One billable event: bumps the hour, day and month windows.
    async fn record(&self, room_id: &str, resource: UsageResource) -> Result<(), UsageError> {
        for period in UsagePeriod::ALL {
            self.increment(room_id, resource, period, 1).await?;
        }
        Ok(())
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// `UsageStore` backed by the `room_usage_counters` table.
#[derive(Clone)]
pub struct SqliteUsageStore {
    db: Arc<Database>,
    clock: Clock,
}

impl SqliteUsageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to pin window boundaries in tests.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn increment(
        &self,
        room_id: &str,
        resource: UsageResource,
        period: UsagePeriod,
        amount: u64,
    ) -> Result<u64, UsageError> {
        let db = self.db.clone();
        let room_id = room_id.to_string();
        let now = self.now();
        let start = period_start(period, now);

        let count = tokio::task::spawn_blocking(move || {
            db.increment_usage_counter(
                &room_id,
                resource.as_str(),
                period.as_str(),
                start,
                amount,
                now,
            )
        })
        .await??;

        debug!("Usage {}_{} now {}", resource, period, count);
        Ok(count)
    }

    async fn get(
        &self,
        room_id: &str,
        resource: UsageResource,
        period: UsagePeriod,
    ) -> Result<u64, UsageError> {
        let db = self.db.clone();
        let room_id = room_id.to_string();
        let start = period_start(period, self.now());

        let count = tokio::task::spawn_blocking(move || {
            db.get_usage_counter(&room_id, resource.as_str(), period.as_str(), start)
        })
        .await??;
        Ok(count)
    }

    async fn cleanup_old(&self) -> Result<usize, UsageError> {
        let db = self.db.clone();
        let cutoffs = cleanup_cutoffs(self.now());

        let deleted = tokio::task::spawn_blocking(move || {
            let cutoffs: Vec<(&str, DateTime<Utc>)> =
                cutoffs.iter().map(|(p, at)| (p.as_str(), *at)).collect();
            db.cleanup_usage_counters(&cutoffs)
        })
        .await??;

        if deleted > 0 {
            info!("Usage cleanup removed {} elapsed counters", deleted);
        }
        Ok(deleted)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
