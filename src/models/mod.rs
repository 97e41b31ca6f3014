use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error_log;
pub mod monitor;
pub mod monitor_change;
pub mod usage_record;

// Re-exports for convenience
pub use error_log::*;
pub use monitor::*;
pub use monitor_change::*;
pub use usage_record::*;

/// Outcome of a single check, as exchanged with the API layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Blocked,
    SelectorMissing,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Blocked => "blocked",
            CheckStatus::SelectorMissing => "selector_missing",
            CheckStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from most to least frequent.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum CheckFrequency {
    Hourly,
    Daily,
}

impl CheckFrequency {
    pub fn interval(&self) -> Duration {
        match self {
            CheckFrequency::Hourly => Duration::hours(1),
            CheckFrequency::Daily => Duration::days(1),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Power,
}

/// The slice of the externally managed user record the engine reads.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct UserProfile {
    pub user_id: String,
    pub tier: Tier,
    pub email: Option<String>,
}

// Helper function to generate IDs
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
