//! Per-room usage counters and the tier quota checks built on them.

pub mod checker;
pub mod period;
pub mod store;

pub use checker::LimitChecker;
pub use store::{SqliteUsageStore, UsageError, UsageStore};
