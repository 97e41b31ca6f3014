use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use crate::models::{
    ErrorLogEntry, Monitor, MonitorChange, NewErrorLog, UsageAggregate, UsageKind, UsageRecord,
    UserProfile,
};
use crate::store::{CheckRecord, CounterIncrement, Store};
use crate::utils::{AppError, Result};

#[derive(Default)]
struct State {
    monitors: Vec<Monitor>,
    changes: Vec<MonitorChange>,
    profiles: HashMap<String, UserProfile>,
    counters: HashMap<(String, String), u32>,
    usage: Vec<UsageRecord>,
    error_logs: Vec<ErrorLogEntry>,
    next_change_id: i64,
    next_error_id: i64,
}

/// In-process store behind a single lock. Every operation is atomic with
/// respect to every other.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_monitor(&self, id: &str) -> Result<Option<Monitor>> {
        let state = self.state.lock().await;
        Ok(state.monitors.iter().find(|m| m.id == id).cloned())
    }

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.monitors.iter().any(|m| m.id == monitor.id) {
            return Err(AppError::Validation(format!("Monitor {} already exists", monitor.id)));
        }
        state.monitors.push(monitor.clone());
        Ok(())
    }

    async fn list_active_monitors(&self) -> Result<Vec<Monitor>> {
        let state = self.state.lock().await;
        Ok(state.monitors.iter().filter(|m| m.active).cloned().collect())
    }

    async fn save_monitor(&self, monitor: &Monitor) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state
            .monitors
            .iter_mut()
            .find(|m| m.id == monitor.id)
            .ok_or_else(|| AppError::monitor_not_found(&monitor.id))?;
        *slot = monitor.clone();
        Ok(())
    }

    async fn record_check(&self, record: &CheckRecord) -> Result<Option<MonitorChange>> {
        let mut state = self.state.lock().await;

        let slot = state
            .monitors
            .iter_mut()
            .find(|m| m.id == record.monitor_id)
            .ok_or_else(|| AppError::monitor_not_found(&record.monitor_id))?;
        record.apply_to(slot);

        Ok(record.change.clone().map(|change| {
            state.next_change_id += 1;
            let recorded = MonitorChange::from_new(state.next_change_id, change);
            state.changes.push(recorded.clone());
            recorded
        }))
    }

    async fn list_changes(&self, monitor_id: &str) -> Result<Vec<MonitorChange>> {
        let state = self.state.lock().await;
        Ok(state
            .changes
            .iter()
            .filter(|c| c.monitor_id == monitor_id)
            .cloned()
            .collect())
    }

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let state = self.state.lock().await;
        Ok(state.profiles.get(user_id).cloned())
    }

    async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()> {
        let mut state = self.state.lock().await;
        state.profiles.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn try_increment_counters(&self, increments: &[CounterIncrement]) -> Result<bool> {
        let mut state = self.state.lock().await;

        let fits = increments.iter().all(|inc| {
            let used = state
                .counters
                .get(&(inc.key.clone(), inc.period.clone()))
                .copied()
                .unwrap_or(0);
            used < inc.cap
        });

        if !fits {
            return Ok(false);
        }

        for inc in increments {
            *state
                .counters
                .entry((inc.key.clone(), inc.period.clone()))
                .or_insert(0) += 1;
        }

        Ok(true)
    }

    async fn counter_value(&self, key: &str, period: &str) -> Result<u32> {
        let state = self.state.lock().await;
        Ok(state
            .counters
            .get(&(key.to_string(), period.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.usage.push(record.clone());
        Ok(())
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageAggregate>> {
        let state = self.state.lock().await;

        let mut totals: BTreeMap<(String, &'static str), (UsageKind, u64, u64)> = BTreeMap::new();
        for record in state.usage.iter().filter(|r| r.timestamp >= since) {
            let entry = totals
                .entry((record.user_id.clone(), record.kind.as_str()))
                .or_insert((record.kind, 0, 0));
            entry.1 += 1;
            if record.success {
                entry.2 += 1;
            }
        }

        Ok(totals
            .into_iter()
            .map(|((user_id, _), (kind, total, succeeded))| UsageAggregate {
                user_id,
                kind,
                total,
                succeeded,
            })
            .collect())
    }

    async fn upsert_error_log(&self, entry: &NewErrorLog, at: DateTime<Utc>) -> Result<ErrorLogEntry> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.error_logs.iter_mut().find(|row| row.matches(entry)) {
            existing.record_repeat(entry, at);
            return Ok(existing.clone());
        }

        state.next_error_id += 1;
        let row = entry.clone().into_entry(state.next_error_id, at);
        state.error_logs.push(row.clone());
        Ok(row)
    }

    async fn list_error_logs(&self, unresolved_only: bool) -> Result<Vec<ErrorLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .error_logs
            .iter()
            .filter(|row| !unresolved_only || !row.resolved)
            .cloned()
            .collect())
    }

    async fn resolve_error_log(&self, id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .error_logs
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| AppError::NotFound {
                resource: format!("error log {}", id),
            })?;
        row.resolved = true;
        Ok(())
    }
}
