use std::sync::Arc;

use tracing::error;

use huddle_types::api::{ComprehensiveUsage, LimitCheck};
use huddle_types::models::{Tier, UsagePeriod, UsageResource};
use huddle_types::tiers::limits_for;

use crate::period::next_reset;
use crate::store::UsageStore;

/// Quota checks against a room's tier. Read-only; callers record usage
/// separately once the guarded action succeeds.
#[derive(Clone)]
pub struct LimitChecker {
    store: Arc<dyn UsageStore>,
}

impl LimitChecker {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    /// `allowed` iff current usage is below `limit`. A failed read denies.
    pub async fn check_limit(
        &self,
        room_id: &str,
        resource: UsageResource,
        period: UsagePeriod,
        limit: u64,
    ) -> LimitCheck {
        let reset_time = Some(next_reset(period, self.store.now()));

        match self.store.get(room_id, resource, period).await {
            Ok(usage) => LimitCheck {
                allowed: usage < limit,
                current_usage: usage,
                limit,
                remaining: limit.saturating_sub(usage),
                reset_time,
            },
            Err(e) => {
                error!(
                    "Usage check {}/{} for room {} failed, denying: {}",
                    resource, period, room_id, e
                );
                LimitCheck {
                    allowed: false,
                    current_usage: 0,
                    limit,
                    remaining: 0,
                    reset_time,
                }
            }
        }
    }

    /// Hourly messages, AI responses and reasoning messages plus daily threads,
    /// read in parallel.
    pub async fn check_comprehensive(&self, room_id: &str, tier: Tier) -> ComprehensiveUsage {
        let limits = limits_for(tier);
        let (messages, ai_responses, reasoning_messages, threads) = tokio::join!(
            self.check_limit(room_id, UsageResource::Messages, UsagePeriod::Hour, limits.messages_per_hour),
            self.check_limit(
                room_id,
                UsageResource::AiResponses,
                UsagePeriod::Hour,
                limits.ai_responses_per_hour
            ),
            self.check_limit(
                room_id,
                UsageResource::ReasoningMessages,
                UsagePeriod::Hour,
                limits.reasoning_messages_per_hour
            ),
            self.check_limit(room_id, UsageResource::Threads, UsagePeriod::Day, limits.threads_per_day),
        );

        ComprehensiveUsage {
            messages,
            ai_responses,
            reasoning_messages,
            threads,
        }
    }

    /// Check every window the tier limits for `resource`. Returns the first
    /// denial, otherwise the window with the least headroom.
    pub async fn check_resource(&self, room_id: &str, tier: Tier, resource: UsageResource) -> LimitCheck {
        let limits = limits_for(tier);
        let mut tightest: Option<LimitCheck> = None;

        for period in [UsagePeriod::Hour, UsagePeriod::Day] {
            let Some(limit) = limits.limit(resource, period) else {
                continue;
            };
            let check = self.check_limit(room_id, resource, period, limit).await;
            if !check.allowed {
                return check;
            }
            if tightest.as_ref().is_none_or(|t| check.remaining < t.remaining) {
                tightest = Some(check);
            }
        }

        tightest.unwrap_or(LimitCheck {
            allowed: true,
            current_usage: 0,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_time: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::seed_room;
    use crate::store::{SqliteUsageStore, UsageError};
    use async_trait::async_trait;
    use huddle_db::Database;
    use huddle_types::tiers::FREE;

    struct FailingStore;

    #[async_trait]
    impl UsageStore for FailingStore {
        async fn increment(
            &self,
            _: &str,
            _: UsageResource,
            _: UsagePeriod,
            _: u64,
        ) -> Result<u64, UsageError> {
            Err(anyhow::anyhow!("disk on fire").into())
        }

        async fn get(&self, _: &str, _: UsageResource, _: UsagePeriod) -> Result<u64, UsageError> {
            Err(anyhow::anyhow!("disk on fire").into())
        }

        async fn cleanup_old(&self) -> Result<usize, UsageError> {
            Ok(0)
        }
    }

    fn sqlite_checker() -> (LimitChecker, String) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let room = seed_room(&db);
        (LimitChecker::new(Arc::new(SqliteUsageStore::new(db))), room)
    }

    #[tokio::test]
    async fn usage_at_limit_is_denied() {
        let (checker, room) = sqlite_checker();
        checker
            .store()
            .increment(&room, UsageResource::Messages, UsagePeriod::Hour, 100)
            .await
            .unwrap();

        let check = checker
            .check_limit(&room, UsageResource::Messages, UsagePeriod::Hour, 100)
            .await;
        assert!(!check.allowed);
        assert_eq!(check.current_usage, 100);
        assert_eq!(check.remaining, 0);
        assert!(check.reset_time.is_some());
    }

    #[tokio::test]
    async fn allowance_shrinks_monotonically() {
        let (checker, room) = sqlite_checker();
        let mut last_remaining = u64::MAX;

        for _ in 0..5 {
            let check = checker
                .check_limit(&room, UsageResource::AiResponses, UsagePeriod::Hour, 3)
                .await;
            assert!(check.remaining <= last_remaining);
            last_remaining = check.remaining;
            checker.store().record(&room, UsageResource::AiResponses).await.unwrap();
        }

        let check = checker
            .check_limit(&room, UsageResource::AiResponses, UsagePeriod::Hour, 3)
            .await;
        assert!(!check.allowed);
        assert_eq!(check.current_usage, 5);
        assert_eq!(check.remaining, 0);
    }

    #[tokio::test]
    async fn read_failure_fails_closed() {
        let checker = LimitChecker::new(Arc::new(FailingStore));
        let check = checker
            .check_limit("room", UsageResource::Messages, UsagePeriod::Hour, 100)
            .await;
        assert!(!check.allowed);
        assert_eq!(check.current_usage, 0);
        assert_eq!(check.limit, 100);
    }

    #[tokio::test]
    async fn comprehensive_check_on_fresh_room() {
        let (checker, room) = sqlite_checker();
        let usage = checker.check_comprehensive(&room, Tier::Free).await;

        assert!(usage.messages.allowed);
        assert_eq!(usage.messages.limit, FREE.messages_per_hour);
        assert_eq!(usage.ai_responses.limit, FREE.ai_responses_per_hour);
        assert_eq!(usage.reasoning_messages.limit, FREE.reasoning_messages_per_hour);
        assert_eq!(usage.threads.limit, FREE.threads_per_day);
        assert_eq!(usage.threads.current_usage, 0);
    }

    #[tokio::test]
    async fn resource_check_reports_exhausted_window() {
        let (checker, room) = sqlite_checker();
        for _ in 0..FREE.threads_per_day {
            checker.store().record(&room, UsageResource::Threads).await.unwrap();
        }

        let check = checker.check_resource(&room, Tier::Free, UsageResource::Threads).await;
        assert!(!check.allowed);
        assert_eq!(check.limit, FREE.threads_per_day);

        let basic = checker.check_resource(&room, Tier::Basic, UsageResource::Threads).await;
        assert!(basic.allowed);
        assert_eq!(basic.remaining, 2);
    }

    #[tokio::test]
    async fn resource_check_picks_tightest_window() {
        let (checker, room) = sqlite_checker();
        checker.store().record(&room, UsageResource::Messages).await.unwrap();

        let check = checker.check_resource(&room, Tier::Free, UsageResource::Messages).await;
        assert!(check.allowed);
        assert_eq!(check.limit, FREE.messages_per_hour);
        assert_eq!(check.remaining, FREE.messages_per_hour - 1);
    }
}
