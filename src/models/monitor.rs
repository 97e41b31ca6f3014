use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::models::{CheckFrequency, CheckStatus, generate_id};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Monitor {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub selector: String,
    pub frequency: CheckFrequency,

    // Last successfully observed value; only an `ok` check writes it
    pub current_value: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_changed: Option<DateTime<Utc>>,
    pub last_status: Option<CheckStatus>,
    pub last_error: Option<String>,

    // Circuit breaker
    pub consecutive_failures: u32,
    pub pause_reason: Option<String>,

    pub active: bool,
    pub email_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMonitor {
    pub user_id: String,
    pub url: String,
    pub selector: String,
    pub frequency: CheckFrequency,
    pub email_enabled: Option<bool>,
}

/// Where a monitor stands when the scheduler looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Due,
    NotDue,
    Paused,
}

impl Monitor {
    pub fn new(new_monitor: NewMonitor) -> Self {
        Self {
            id: generate_id(),
            user_id: new_monitor.user_id,
            url: new_monitor.url,
            selector: new_monitor.selector,
            frequency: new_monitor.frequency,
            current_value: None,
            last_checked: None,
            last_changed: None,
            last_status: None,
            last_error: None,
            consecutive_failures: 0,
            pause_reason: None,
            active: true,
            email_enabled: new_monitor.email_enabled.unwrap_or(true),
            created_at: Utc::now(),
        }
    }

    /// The slower of the monitor's own frequency and the tier's floor.
    pub fn effective_frequency(&self, tier_floor: CheckFrequency) -> CheckFrequency {
        self.frequency.max(tier_floor)
    }

    pub fn schedule_state(&self, now: DateTime<Utc>, tier_floor: CheckFrequency) -> ScheduleState {
        if !self.active {
            return ScheduleState::Paused;
        }

        match self.last_checked {
            None => ScheduleState::Due, // Never checked before
            Some(last_checked) => {
                let interval = self.effective_frequency(tier_floor).interval();
                if now.signed_duration_since(last_checked) >= interval {
                    ScheduleState::Due
                } else {
                    ScheduleState::NotDue
                }
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        !self.active
    }

    /// Human re-activation after an auto-pause. Called by the management API,
    /// never by the check engine.
    pub fn reactivate(&mut self) {
        self.active = true;
        self.pause_reason = None;
        self.consecutive_failures = 0;
    }
}
