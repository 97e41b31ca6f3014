use async_trait::async_trait;
use tracing::debug;

use crate::plugins::traits::{ChangeNotification, NotificationResult, Notifier};
use crate::utils::Result;

/// Used when no outbound channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn name(&self) -> &str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn notify(&self, notification: &ChangeNotification) -> Result<NotificationResult> {
        debug!(monitor_id = %notification.monitor_id, "Notification dropped, no channel configured");
        Ok(NotificationResult::failed("No notification channel configured"))
    }
}
