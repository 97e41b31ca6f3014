use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::models::generate_id;

/// Metered third-party capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum UsageKind {
    Render,
    Email,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Render => "render",
            UsageKind::Email => "email",
        }
    }
}

impl std::fmt::Display for UsageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub monitor_id: Option<String>,
    pub kind: UsageKind,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

impl UsageRecord {
    pub fn new(
        kind: UsageKind,
        user_id: &str,
        monitor_id: Option<&str>,
        success: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_id(),
            user_id: user_id.to_string(),
            monitor_id: monitor_id.map(str::to_string),
            kind,
            timestamp,
            success,
        }
    }
}

/// Per-user, per-kind totals over a window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageAggregate {
    pub user_id: String,
    pub kind: UsageKind,
    pub total: u64,
    pub succeeded: u64,
}
