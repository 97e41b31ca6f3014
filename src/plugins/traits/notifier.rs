use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::Result;

/// A recorded change, addressed to the monitor's owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeNotification {
    pub monitor_id: String,
    pub url: String,
    pub selector: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub recipient: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl NotificationResult {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Outbound change delivery (email today).
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether sending can reach anyone; callers skip quota and delivery
    /// when it cannot.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn notify(&self, notification: &ChangeNotification) -> Result<NotificationResult>;
}
