use chrono::{DateTime, Utc};

use crate::classifier::Classification;
use crate::models::{CheckStatus, Monitor, NewMonitorChange};
use crate::store::CheckRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeOutcome {
    pub changed: bool,
    pub monitor: Monitor,
    pub change: Option<NewMonitorChange>,
    /// True only on the check that flipped the monitor to inactive.
    pub paused: bool,
}

impl ChangeOutcome {
    /// The row writes this outcome needs, relative to whatever is stored
    /// when they land.
    pub fn record(&self) -> CheckRecord {
        let monitor = &self.monitor;
        CheckRecord {
            monitor_id: monitor.id.clone(),
            status: monitor.last_status.unwrap_or(CheckStatus::Error),
            checked_at: monitor.last_checked.unwrap_or(monitor.created_at),
            current_value: monitor.current_value.clone(),
            last_error: monitor.last_error.clone(),
            pause_reason: if self.paused { monitor.pause_reason.clone() } else { None },
            change: self.change.clone(),
        }
    }
}

/// Applies a classification to a monitor's stored state.
///
/// Only `ok` touches `current_value`. The first `ok` on a monitor that has
/// never held a value sets the baseline without recording a change.
/// Failures count towards `pause_threshold`; reaching it deactivates the
/// monitor, and nothing here ever reactivates one.
pub fn reconcile(
    monitor: &Monitor,
    classification: &Classification,
    pause_threshold: u32,
    now: DateTime<Utc>,
) -> ChangeOutcome {
    let mut updated = monitor.clone();
    updated.last_checked = Some(now);
    updated.last_status = Some(classification.status());

    match classification {
        Classification::Ok { value } => {
            let is_baseline = monitor.current_value.is_none() && monitor.last_changed.is_none();
            let differs = monitor.current_value.as_deref() != Some(value.as_str());

            let change = (differs && !is_baseline).then(|| NewMonitorChange {
                monitor_id: monitor.id.clone(),
                old_value: monitor.current_value.clone(),
                new_value: value.clone(),
                detected_at: now,
            });

            if change.is_some() {
                updated.last_changed = Some(now);
            }
            updated.current_value = Some(value.clone());
            updated.last_error = None;
            updated.consecutive_failures = 0;

            ChangeOutcome {
                changed: change.is_some(),
                monitor: updated,
                change,
                paused: false,
            }
        }
        failure => {
            updated.last_error = failure.message().map(str::to_string);
            updated.consecutive_failures = monitor.consecutive_failures.saturating_add(1);

            let paused = monitor.active && updated.consecutive_failures >= pause_threshold;
            if paused {
                updated.active = false;
                updated.pause_reason = Some(format!(
                    "Paused after {} consecutive failed checks (last: {}: {})",
                    updated.consecutive_failures,
                    failure.status(),
                    failure.message().unwrap_or("no details"),
                ));
            }

            ChangeOutcome {
                changed: false,
                monitor: updated,
                change: None,
                paused,
            }
        }
    }
}
