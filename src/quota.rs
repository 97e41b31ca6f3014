use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{QuotaConfig, TiersConfig};
use crate::models::{Tier, UsageAggregate, UsageKind, UsageRecord};
use crate::store::{CounterIncrement, Store};
use crate::utils::Result;

/// Shared render/email capacity, enforced per user and system-wide.
///
/// Counters live in the store and are bumped with a single atomic
/// increment-with-cap, so concurrent checks can never overshoot a cap.
pub struct QuotaTracker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    tiers: TiersConfig,
    system: QuotaConfig,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, tiers: TiersConfig, system: QuotaConfig) -> Self {
        Self {
            store,
            clock,
            tiers,
            system,
        }
    }

    /// Render quota resets monthly, email quota daily.
    pub fn period(kind: UsageKind, at: DateTime<Utc>) -> String {
        match kind {
            UsageKind::Render => at.format("%Y-%m").to_string(),
            UsageKind::Email => at.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn user_key(kind: UsageKind, user_id: &str) -> String {
        format!("{}:user:{}", kind, user_id)
    }

    pub fn system_key(kind: UsageKind) -> String {
        format!("{}:system", kind)
    }

    fn caps(&self, kind: UsageKind, tier: Tier) -> (u32, u32) {
        let limits = self.tiers.limits(tier);
        match kind {
            UsageKind::Render => (limits.render_calls_per_month, self.system.system_render_calls_per_month),
            UsageKind::Email => (limits.emails_per_day, self.system.system_emails_per_day),
        }
    }

    fn increments(&self, kind: UsageKind, user_id: &str, tier: Tier) -> [CounterIncrement; 2] {
        let period = Self::period(kind, self.clock.now());
        let (user_cap, system_cap) = self.caps(kind, tier);
        [
            CounterIncrement::new(Self::user_key(kind, user_id), period.clone(), user_cap),
            CounterIncrement::new(Self::system_key(kind), period, system_cap),
        ]
    }

    /// Consumes one unit of `kind` for `user_id`. Granted only if both the
    /// user's tier cap and the system cap have room; neither counter moves
    /// otherwise.
    pub async fn try_consume(&self, kind: UsageKind, user_id: &str, tier: Tier) -> Result<bool> {
        let granted = self
            .store
            .try_increment_counters(&self.increments(kind, user_id, tier))
            .await?;

        debug!(user_id, kind = %kind, granted, "Quota consumption");
        metrics::counter!("pagewatch_quota_requests_total", "kind" => kind.as_str(), "granted" => granted.to_string())
            .increment(1);

        Ok(granted)
    }

    /// Read-only guess at whether `try_consume` would succeed. Not a
    /// reservation; store errors read as plausible.
    pub async fn is_plausible(&self, kind: UsageKind, user_id: &str, tier: Tier) -> bool {
        for inc in self.increments(kind, user_id, tier) {
            match self.store.counter_value(&inc.key, &inc.period).await {
                Ok(used) if used >= inc.cap => return false,
                Ok(_) => {}
                Err(e) => {
                    warn!("Quota lookup for {} failed: {}", inc.key, e);
                    return true;
                }
            }
        }
        true
    }

    /// Appends a usage event. Failures are logged and swallowed.
    pub async fn record_usage(&self, kind: UsageKind, user_id: &str, monitor_id: Option<&str>, success: bool) {
        let record = UsageRecord::new(kind, user_id, monitor_id, success, self.clock.now());
        if let Err(e) = self.store.append_usage(&record).await {
            warn!("Failed to record {} usage for {}: {}", kind, user_id, e);
        }
    }

    /// Totals over the trailing `window`.
    pub async fn usage_since(&self, window: Duration) -> Result<Vec<UsageAggregate>> {
        self.store.usage_since(self.clock.now() - window).await
    }
}
