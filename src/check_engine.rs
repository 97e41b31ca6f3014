use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::browser::Renderer;
use crate::change_detector::{self, ChangeOutcome};
use crate::classifier::{classify, Classification};
use crate::clock::Clock;
use crate::config::{AppConfig, TiersConfig};
use crate::element_finder::{SuggestionEngine, SuggestionReport};
use crate::error_log::ErrorLogger;
use crate::models::{CheckStatus, LogLevel, Monitor, MonitorChange, NewErrorLog, UsageKind, UserProfile};
use crate::plugins::{ChangeNotification, Notifier};
use crate::quota::QuotaTracker;
use crate::scraper::{ExtractError, Extractor, RenderAccount};
use crate::store::Store;
use crate::utils::{AppError, Result};

const LOG_SOURCE: &str = "check_engine";

/// Most of a check's budget held back for persisting its result.
const PERSIST_RESERVE: Duration = Duration::from_secs(10);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// What a single check did, as returned to the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckReport {
    pub monitor_id: String,
    pub changed: bool,
    pub current_value: Option<String>,
    pub status: CheckStatus,
    pub error: Option<String>,
    pub paused: bool,
    pub render_used: bool,
    pub notified: bool,
}

/// Runs the per-monitor pipeline: extract, reconcile consent/challenges,
/// classify, detect changes, persist, notify.
pub struct CheckEngine {
    store: Arc<dyn Store>,
    extractor: Extractor,
    quota: Arc<QuotaTracker>,
    notifier: Arc<dyn Notifier>,
    logger: ErrorLogger,
    suggestions: SuggestionEngine,
    tiers: TiersConfig,
    clock: Arc<dyn Clock>,
    check_timeout: Duration,
}

impl CheckEngine {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn Store>,
        renderer: Arc<dyn Renderer>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let quota = Arc::new(QuotaTracker::new(
            store.clone(),
            clock.clone(),
            config.tiers.clone(),
            config.quota.clone(),
        ));
        let extractor = Extractor::new(config.scraper.clone(), renderer, quota.clone())?;

        Ok(Self {
            logger: ErrorLogger::new(store.clone(), clock.clone()),
            store,
            extractor,
            quota,
            notifier,
            suggestions: SuggestionEngine::default(),
            tiers: config.tiers.clone(),
            clock,
            check_timeout: config.scheduler.check_timeout(),
        })
    }

    pub fn quota(&self) -> Arc<QuotaTracker> {
        self.quota.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn tiers(&self) -> &TiersConfig {
        &self.tiers
    }

    /// The owner's profile, or a free-tier profile with no email when the
    /// user is unknown or the lookup fails.
    pub async fn profile_for(&self, user_id: &str) -> UserProfile {
        match self.store.user_profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => UserProfile {
                user_id: user_id.to_string(),
                tier: Default::default(),
                email: None,
            },
            Err(e) => {
                warn!("Profile lookup for {} failed, assuming free tier: {}", user_id, e);
                UserProfile {
                    user_id: user_id.to_string(),
                    tier: Default::default(),
                    email: None,
                }
            }
        }
    }

    /// One-off check outside the scheduler tick.
    pub async fn check_now(&self, monitor_id: &str) -> Result<CheckReport> {
        let monitor = self
            .store
            .get_monitor(monitor_id)
            .await?
            .ok_or_else(|| AppError::monitor_not_found(monitor_id))?;
        let profile = self.profile_for(&monitor.user_id).await;

        Ok(self.run_check(monitor, &profile, true).await)
    }

    /// Proposes alternative selectors for a monitor from a fresh DOM.
    pub async fn suggest_selectors(&self, monitor_id: &str, expected_text: Option<&str>) -> Result<SuggestionReport> {
        let monitor = self
            .store
            .get_monitor(monitor_id)
            .await?
            .ok_or_else(|| AppError::monitor_not_found(monitor_id))?;
        let profile = self.profile_for(&monitor.user_id).await;
        let account = RenderAccount {
            user_id: monitor.user_id.clone(),
            monitor_id: Some(monitor.id.clone()),
            tier: profile.tier,
        };

        let page = self
            .extractor
            .fetch_dom(&monitor.url, Some(&account))
            .await
            .map_err(suggestion_fetch_error)?;

        if let Some(reason) = page.block_reason {
            return Err(AppError::Blocked { reason });
        }

        debug!(monitor_id, render_used = page.render_used, "Analysing DOM for selector suggestions");
        Ok(self.suggestions.suggest(&page.dom, &monitor.selector, expected_text))
    }

    /// Runs the full pipeline for `monitor`. Never fails: timeouts, panics
    /// and extractor failures all become a classification on the monitor.
    pub async fn run_check(&self, monitor: Monitor, profile: &UserProfile, allow_render: bool) -> CheckReport {
        let span = info_span!("check", monitor_id = %monitor.id);
        self.run_check_inner(monitor, profile, allow_render).instrument(span).await
    }

    async fn run_check_inner(&self, monitor: Monitor, profile: &UserProfile, allow_render: bool) -> CheckReport {
        let started = Instant::now();
        let deadline = started + self.check_timeout;
        let (extract_budget, _) = split_budget(self.check_timeout);
        let account = allow_render.then(|| RenderAccount {
            user_id: monitor.user_id.clone(),
            monitor_id: Some(monitor.id.clone()),
            tier: profile.tier,
        });

        let attempt = AssertUnwindSafe(self.extract_and_classify(&monitor, account.as_ref())).catch_unwind();
        let Attempt {
            classification,
            render_used,
            trace,
        } = match tokio::time::timeout(extract_budget, attempt).await {
            Ok(Ok(attempt)) => attempt,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!("Check panicked: {}", message);
                Attempt {
                    classification: Classification::error(format!("Unexpected failure: {}", message)),
                    render_used: false,
                    trace: Some(format!("panicked at check of {}: {}", monitor.url, message)),
                }
            }
            Err(_) => Attempt {
                classification: Classification::error(format!(
                    "Check timed out after {}s",
                    self.check_timeout.as_secs()
                )),
                render_used: false,
                trace: None,
            },
        };

        let pause_threshold = self.tiers.limits(profile.tier).pause_threshold;
        let outcome = change_detector::reconcile(&monitor, &classification, pause_threshold, self.clock.now());

        let recorded = match tokio::time::timeout(
            deadline.saturating_duration_since(Instant::now()),
            self.store.record_check(&outcome.record()),
        )
        .await
        {
            Ok(Ok(recorded)) => recorded,
            Ok(Err(e)) => {
                self.log_persist_failure(&monitor, &e.to_string()).await;
                None
            }
            Err(_) => {
                self.log_persist_failure(&monitor, "timed out").await;
                None
            }
        };

        if !classification.is_ok() {
            self.log_failure(&outcome, &classification, trace).await;
        }
        if outcome.paused {
            info!(
                reason = outcome.monitor.pause_reason.as_deref().unwrap_or_default(),
                "Monitor auto-paused"
            );
        }

        let notified = match &recorded {
            Some(change) => self.notify_change(&outcome.monitor, profile, change).await,
            None => false,
        };

        let status = classification.status();
        metrics::counter!("pagewatch_checks_total", "status" => status.as_str()).increment(1);
        metrics::histogram!("pagewatch_check_duration_seconds").record(started.elapsed().as_secs_f64());
        debug!(status = %status, changed = outcome.changed, "Check finished");

        CheckReport {
            monitor_id: outcome.monitor.id.clone(),
            changed: recorded.is_some(),
            current_value: outcome.monitor.current_value.clone(),
            status,
            error: classification.message().map(str::to_string),
            paused: outcome.paused,
            render_used,
            notified,
        }
    }

    async fn extract_and_classify(
        &self,
        monitor: &Monitor,
        account: Option<&RenderAccount>,
    ) -> Attempt {
        let result = self.extractor.extract(&monitor.url, &monitor.selector, account).await;

        let (render_used, reconciliation, trace) = match &result {
            Ok(extraction) => (extraction.render_used, extraction.reconciliation.clone(), None),
            Err(e) => {
                debug!("Extraction failed: {}", e);
                (false, None, Some(format!("{:?}", e)))
            }
        };

        Attempt {
            classification: classify(&result, reconciliation.as_ref()),
            render_used,
            trace,
        }
    }

    async fn log_failure(&self, outcome: &ChangeOutcome, classification: &Classification, trace: Option<String>) {
        let monitor = &outcome.monitor;
        let status = classification.status();
        let level = match status {
            CheckStatus::Error => LogLevel::Error,
            _ => LogLevel::Warning,
        };

        let mut entry = NewErrorLog::new(
            level,
            LOG_SOURCE,
            format!(
                "Monitor {} {}: {}",
                monitor.id,
                status,
                classification.message().unwrap_or("no details")
            ),
        )
        .with_type(status.as_str())
        .with_context(json!({
            "monitor_id": monitor.id,
            "user_id": monitor.user_id,
            "url": monitor.url,
            "selector": monitor.selector,
            "consecutive_failures": monitor.consecutive_failures,
            "paused": outcome.paused,
        }));
        if let Some(trace) = trace {
            entry = entry.with_stack_trace(trace);
        }

        self.logger.log(entry).await;
    }

    async fn log_persist_failure(&self, monitor: &Monitor, reason: &str) {
        warn!("Failed to persist check result: {}", reason);
        self.logger
            .log(
                NewErrorLog::error(LOG_SOURCE, format!("Failed to persist check for monitor {}", monitor.id))
                    .with_type("persistence")
                    .with_context(json!({ "monitor_id": monitor.id, "reason": reason })),
            )
            .await;
    }

    /// Emails the owner about a recorded change. Failures are logged, never
    /// raised.
    async fn notify_change(&self, monitor: &Monitor, profile: &UserProfile, change: &MonitorChange) -> bool {
        if !monitor.email_enabled || !self.notifier.is_enabled() {
            return false;
        }
        let Some(recipient) = profile.email.clone() else {
            debug!("No email on file for {}, skipping notification", profile.user_id);
            return false;
        };

        match self.quota.try_consume(UsageKind::Email, &profile.user_id, profile.tier).await {
            Ok(true) => {}
            Ok(false) => {
                self.logger
                    .log(
                        NewErrorLog::warning(LOG_SOURCE, format!("Email quota exhausted for user {}", profile.user_id))
                            .with_type("quota"),
                    )
                    .await;
                return false;
            }
            Err(e) => {
                self.logger
                    .log(
                        NewErrorLog::error(LOG_SOURCE, format!("Email quota check failed for user {}", profile.user_id))
                            .with_type("quota")
                            .with_context(json!({ "error": e.to_string() })),
                    )
                    .await;
                return false;
            }
        }

        let notification = ChangeNotification {
            monitor_id: monitor.id.clone(),
            url: monitor.url.clone(),
            selector: monitor.selector.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            recipient,
            detected_at: change.detected_at,
        };

        let error = match tokio::time::timeout(NOTIFY_TIMEOUT, self.notifier.notify(&notification)).await {
            Ok(Ok(result)) if result.success => None,
            Ok(Ok(result)) => Some(result.error.unwrap_or_else(|| "delivery rejected".to_string())),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {}s", NOTIFY_TIMEOUT.as_secs())),
        };

        self.quota
            .record_usage(UsageKind::Email, &profile.user_id, Some(&monitor.id), error.is_none())
            .await;

        match error {
            None => true,
            Some(error) => {
                self.logger
                    .log(
                        NewErrorLog::error(
                            LOG_SOURCE,
                            format!("Failed to notify {} about monitor {}", self.notifier.name(), monitor.id),
                        )
                        .with_type("notification")
                        .with_context(json!({ "monitor_id": monitor.id, "error": error })),
                    )
                    .await;
                false
            }
        }
    }
}

struct Attempt {
    classification: Classification,
    render_used: bool,
    /// Debug detail of whatever went wrong, kept as the log's stack trace.
    trace: Option<String>,
}

fn suggestion_fetch_error(err: ExtractError) -> AppError {
    match err {
        ExtractError::RenderQuotaExhausted => AppError::QuotaExhausted("render quota exhausted".to_string()),
        ExtractError::Render(message) => AppError::Render(message),
        other => AppError::Scraping(other.to_string()),
    }
}

/// Splits a check's budget into extraction time and a persistence reserve,
/// so the whole chain fits inside `total`.
fn split_budget(total: Duration) -> (Duration, Duration) {
    let reserve = PERSIST_RESERVE.min(total / 4);
    (total - reserve, reserve)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
