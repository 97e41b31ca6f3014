use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only record of an observed value change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct MonitorChange {
    pub id: i64,
    pub monitor_id: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMonitorChange {
    pub monitor_id: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub detected_at: DateTime<Utc>,
}

impl MonitorChange {
    pub fn from_new(id: i64, change: NewMonitorChange) -> Self {
        Self {
            id,
            monitor_id: change.monitor_id,
            old_value: change.old_value,
            new_value: change.new_value,
            detected_at: change.detected_at,
        }
    }
}
