use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

use crate::check_engine::{CheckEngine, CheckReport};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::models::{CheckStatus, ScheduleState, UsageKind, UserProfile};
use crate::utils::{AppError, Result};

/// Summary of one scheduler pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TickReport {
    pub due: usize,
    pub checked: usize,
    pub ok: usize,
    pub failed: usize,
    pub changes: usize,
    pub paused: usize,
    pub skipped_not_due: usize,
    pub render_deferred: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub checks_run: u64,
    pub checks_ok: u64,
    pub checks_failed: u64,
    pub changes_detected: u64,
    pub monitors_paused: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_duration_ms: u64,
    pub average_tick_ms: f64,
    pub uptime_seconds: u64,
}

/// Periodically walks active monitors and runs the due ones with bounded
/// concurrency.
pub struct Scheduler {
    engine: Arc<CheckEngine>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    stats: Arc<RwLock<SchedulerStats>>,
    start_time: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(engine: Arc<CheckEngine>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        let start_time = clock.now();
        Self {
            engine,
            clock,
            config,
            stats: Arc::new(RwLock::new(SchedulerStats::default())),
            start_time,
        }
    }

    /// Ticks until `shutdown` flips to true. A tick already in progress
    /// finishes before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            tick_secs = self.config.tick_interval_secs,
            max_concurrent = self.config.max_concurrent_checks,
            "Monitor scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_tick().await {
                        Ok(report) => tracing::info!(
                            due = report.due,
                            ok = report.ok,
                            failed = report.failed,
                            changes = report.changes,
                            paused = report.paused,
                            duration_ms = report.duration_ms,
                            "Scheduler tick complete"
                        ),
                        Err(e) => tracing::error!("Scheduler tick failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Monitor scheduler stopped");
    }

    /// One pass over the active monitors. Checks run concurrently up to
    /// `max_concurrent_checks`; the pass waits for all of them.
    pub async fn run_tick(&self) -> Result<TickReport> {
        let started = Instant::now();
        let now = self.clock.now();
        let store = self.engine.store();
        let quota = self.engine.quota();
        let tiers = self.engine.tiers().clone();

        let monitors = store.list_active_monitors().await?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_checks.max(1)));
        let mut profiles: HashMap<String, UserProfile> = HashMap::new();
        let mut report = TickReport::default();
        let mut handles = Vec::new();

        for monitor in monitors {
            let profile = match profiles.get(&monitor.user_id) {
                Some(profile) => profile.clone(),
                None => {
                    let profile = self.engine.profile_for(&monitor.user_id).await;
                    profiles.insert(monitor.user_id.clone(), profile.clone());
                    profile
                }
            };

            let floor = tiers.limits(profile.tier).min_frequency;
            match monitor.schedule_state(now, floor) {
                ScheduleState::Due => {}
                ScheduleState::NotDue => {
                    report.skipped_not_due += 1;
                    continue;
                }
                ScheduleState::Paused => continue,
            }
            report.due += 1;

            let allow_render = quota.is_plausible(UsageKind::Render, &profile.user_id, profile.tier).await;
            if !allow_render {
                report.render_deferred += 1;
                tracing::debug!(monitor_id = %monitor.id, "Render quota spent, checking statically");
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(format!("Check semaphore closed: {}", e)))?;
            let engine = Arc::clone(&self.engine);
            let monitor_id = monitor.id.clone();

            handles.push((
                monitor_id,
                tokio::spawn(async move {
                    let _permit = permit;
                    engine.run_check(monitor, &profile, allow_render).await
                }),
            ));
        }

        for (monitor_id, handle) in handles {
            match handle.await {
                Ok(check) => tally(&mut report, &check),
                Err(e) => {
                    report.checked += 1;
                    report.failed += 1;
                    tracing::error!(monitor_id = %monitor_id, "Check task failed: {}", e);
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("pagewatch_tick_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("pagewatch_ticks_total").increment(1);
        self.update_stats(&report, now).await;

        Ok(report)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats.read().await.clone();
        stats.uptime_seconds = (self.clock.now() - self.start_time).num_seconds().max(0) as u64;
        stats
    }

    async fn update_stats(&self, report: &TickReport, at: DateTime<Utc>) {
        let mut stats = self.stats.write().await;

        stats.ticks += 1;
        stats.checks_run += report.checked as u64;
        stats.checks_ok += report.ok as u64;
        stats.checks_failed += report.failed as u64;
        stats.changes_detected += report.changes as u64;
        stats.monitors_paused += report.paused as u64;
        stats.last_tick_at = Some(at);
        stats.last_tick_duration_ms = report.duration_ms;

        // Running mean over all ticks
        let ticks = stats.ticks as f64;
        stats.average_tick_ms += (report.duration_ms as f64 - stats.average_tick_ms) / ticks;
    }
}

fn tally(report: &mut TickReport, check: &CheckReport) {
    report.checked += 1;
    if check.status == CheckStatus::Ok {
        report.ok += 1;
    } else {
        report.failed += 1;
    }
    if check.changed {
        report.changes += 1;
    }
    if check.paused {
        report.paused += 1;
    }
}
