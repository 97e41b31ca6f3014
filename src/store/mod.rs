use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CheckStatus, ErrorLogEntry, Monitor, MonitorChange, NewErrorLog, NewMonitorChange, UsageAggregate,
    UsageRecord, UserProfile,
};
use crate::utils::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One counter bump requested as part of an all-or-nothing increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterIncrement {
    pub key: String,
    pub period: String,
    pub cap: u32,
}

impl CounterIncrement {
    pub fn new(key: impl Into<String>, period: impl Into<String>, cap: u32) -> Self {
        Self {
            key: key.into(),
            period: period.into(),
            cap,
        }
    }
}

/// What one finished check writes to its monitor row.
///
/// Only the fields a check owns are written. The failure counter moves
/// relative to the stored row, and `active`/`pause_reason` are written only
/// when this check is the one that paused the monitor, so edits made while
/// the check was in flight survive.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRecord {
    pub monitor_id: String,
    pub status: CheckStatus,
    pub checked_at: DateTime<Utc>,
    /// Written only when `status` is ok.
    pub current_value: Option<String>,
    pub last_error: Option<String>,
    /// Set when this check reached the pause threshold.
    pub pause_reason: Option<String>,
    /// Also moves `last_changed` to its `detected_at`.
    pub change: Option<NewMonitorChange>,
}

impl CheckRecord {
    pub fn succeeded(&self) -> bool {
        self.status == CheckStatus::Ok
    }

    pub fn pauses(&self) -> bool {
        self.pause_reason.is_some()
    }

    /// Applies the record to an in-memory copy of the row.
    pub fn apply_to(&self, monitor: &mut Monitor) {
        monitor.last_checked = Some(self.checked_at);
        monitor.last_status = Some(self.status);
        monitor.last_error = self.last_error.clone();

        if self.succeeded() {
            monitor.current_value = self.current_value.clone();
            monitor.consecutive_failures = 0;
        } else {
            monitor.consecutive_failures = monitor.consecutive_failures.saturating_add(1);
        }
        if let Some(change) = &self.change {
            monitor.last_changed = Some(change.detected_at);
        }
        if self.pauses() && monitor.active {
            monitor.active = false;
            monitor.pause_reason = self.pause_reason.clone();
        }
    }
}

/// Persistence seam for the check engine.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_monitor(&self, id: &str) -> Result<Option<Monitor>>;

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()>;

    async fn list_active_monitors(&self) -> Result<Vec<Monitor>>;

    /// Overwrites every mutable field of the monitor. This is the external
    /// CRUD path (edits, manual pause and reactivation); checks use
    /// `record_check`.
    async fn save_monitor(&self, monitor: &Monitor) -> Result<()>;

    /// Applies a check's result and, when present, appends the change row.
    /// Both land or neither does.
    async fn record_check(&self, record: &CheckRecord) -> Result<Option<MonitorChange>>;

    async fn list_changes(&self, monitor_id: &str) -> Result<Vec<MonitorChange>>;

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()>;

    /// Increments every counter by one if and only if each stays within its
    /// cap. Returns whether the increment was applied.
    async fn try_increment_counters(&self, increments: &[CounterIncrement]) -> Result<bool>;

    async fn counter_value(&self, key: &str, period: &str) -> Result<u32>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<()>;

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageAggregate>>;

    /// Inserts a new row, or bumps the occurrence count of the unresolved
    /// row with the same (level, source, message).
    async fn upsert_error_log(&self, entry: &NewErrorLog, at: DateTime<Utc>) -> Result<ErrorLogEntry>;

    async fn list_error_logs(&self, unresolved_only: bool) -> Result<Vec<ErrorLogEntry>>;

    async fn resolve_error_log(&self, id: i64) -> Result<()>;
}
