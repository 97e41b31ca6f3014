use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::models::{
    ErrorLogEntry, Monitor, MonitorChange, NewErrorLog, UsageAggregate, UsageKind, UsageRecord,
    UserProfile,
};
use crate::store::{CheckRecord, CounterIncrement, Store};
use crate::utils::{AppError, Result};

const MONITOR_COLUMNS: &str = "id, user_id, url, selector, frequency, current_value, last_checked, \
     last_changed, last_status, last_error, consecutive_failures, pause_reason, active, \
     email_enabled, created_at";

const ERROR_LOG_COLUMNS: &str = "id, level, source, message, error_type, stack_trace, context, \
     occurrence_count, first_occurrence, timestamp, resolved";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool).await?;
        info!("Connected to database at {}", config.url);
        Ok(store)
    }

    /// Wraps an existing pool and brings its schema up to date.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_monitor(&self, id: &str) -> Result<Option<Monitor>> {
        let monitor = sqlx::query_as::<_, Monitor>(&format!(
            "SELECT {} FROM monitors WHERE id = ?",
            MONITOR_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(monitor)
    }

    async fn insert_monitor(&self, monitor: &Monitor) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO monitors ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            MONITOR_COLUMNS
        ))
        .bind(&monitor.id)
        .bind(&monitor.user_id)
        .bind(&monitor.url)
        .bind(&monitor.selector)
        .bind(monitor.frequency)
        .bind(&monitor.current_value)
        .bind(monitor.last_checked)
        .bind(monitor.last_changed)
        .bind(monitor.last_status)
        .bind(&monitor.last_error)
        .bind(monitor.consecutive_failures)
        .bind(&monitor.pause_reason)
        .bind(monitor.active)
        .bind(monitor.email_enabled)
        .bind(monitor.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_active_monitors(&self) -> Result<Vec<Monitor>> {
        let monitors = sqlx::query_as::<_, Monitor>(&format!(
            "SELECT {} FROM monitors WHERE active = 1 ORDER BY created_at",
            MONITOR_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(monitors)
    }

    async fn save_monitor(&self, monitor: &Monitor) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE monitors SET
                url = ?, selector = ?, frequency = ?, current_value = ?, last_checked = ?,
                last_changed = ?, last_status = ?, last_error = ?, consecutive_failures = ?,
                pause_reason = ?, active = ?, email_enabled = ?
            WHERE id = ?
            "#,
        )
        .bind(&monitor.url)
        .bind(&monitor.selector)
        .bind(monitor.frequency)
        .bind(&monitor.current_value)
        .bind(monitor.last_checked)
        .bind(monitor.last_changed)
        .bind(monitor.last_status)
        .bind(&monitor.last_error)
        .bind(monitor.consecutive_failures)
        .bind(&monitor.pause_reason)
        .bind(monitor.active)
        .bind(monitor.email_enabled)
        .bind(&monitor.id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::monitor_not_found(&monitor.id));
        }
        Ok(())
    }

    async fn record_check(&self, record: &CheckRecord) -> Result<Option<MonitorChange>> {
        let mut tx = self.pool.begin().await?;
        let succeeded = record.succeeded();
        let pauses = record.pauses();

        // SET expressions all read the pre-update row
        let updated = sqlx::query(
            r#"
            UPDATE monitors SET
                last_checked = ?,
                last_status = ?,
                last_error = ?,
                current_value = CASE WHEN ? THEN ? ELSE current_value END,
                last_changed = COALESCE(?, last_changed),
                consecutive_failures = CASE WHEN ? THEN 0 ELSE consecutive_failures + 1 END,
                pause_reason = CASE WHEN ? AND active = 1 THEN ? ELSE pause_reason END,
                active = CASE WHEN ? THEN 0 ELSE active END
            WHERE id = ?
            "#,
        )
        .bind(record.checked_at)
        .bind(record.status)
        .bind(&record.last_error)
        .bind(succeeded)
        .bind(&record.current_value)
        .bind(record.change.as_ref().map(|change| change.detected_at))
        .bind(succeeded)
        .bind(pauses)
        .bind(&record.pause_reason)
        .bind(pauses)
        .bind(&record.monitor_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::monitor_not_found(&record.monitor_id));
        }

        let recorded = match record.change.clone() {
            Some(change) => {
                let result = sqlx::query(
                    "INSERT INTO monitor_changes (monitor_id, old_value, new_value, detected_at) VALUES (?, ?, ?, ?)",
                )
                .bind(&change.monitor_id)
                .bind(&change.old_value)
                .bind(&change.new_value)
                .bind(change.detected_at)
                .execute(&mut *tx)
                .await?;

                Some(MonitorChange::from_new(result.last_insert_rowid(), change))
            }
            None => None,
        };

        tx.commit().await?;
        Ok(recorded)
    }

    async fn list_changes(&self, monitor_id: &str) -> Result<Vec<MonitorChange>> {
        let changes = sqlx::query_as::<_, MonitorChange>(
            "SELECT id, monitor_id, old_value, new_value, detected_at FROM monitor_changes WHERE monitor_id = ? ORDER BY id",
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(changes)
    }

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            "SELECT user_id, tier, email FROM user_profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, tier, email) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET tier = excluded.tier, email = excluded.email
            "#,
        )
        .bind(&profile.user_id)
        .bind(profile.tier)
        .bind(&profile.email)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_increment_counters(&self, increments: &[CounterIncrement]) -> Result<bool> {
        if increments.iter().any(|inc| inc.cap == 0) {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;

        for inc in increments {
            // The conditional update turns into a no-op once the cap is hit
            let result = sqlx::query(
                r#"
                INSERT INTO quota_counters (counter_key, period, used) VALUES (?, ?, 1)
                ON CONFLICT(counter_key, period) DO UPDATE SET used = used + 1
                WHERE used < ?
                "#,
            )
            .bind(&inc.key)
            .bind(&inc.period)
            .bind(inc.cap)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn counter_value(&self, key: &str, period: &str) -> Result<u32> {
        let used: Option<(u32,)> = sqlx::query_as(
            "SELECT used FROM quota_counters WHERE counter_key = ? AND period = ?",
        )
        .bind(key)
        .bind(period)
        .fetch_optional(&self.pool)
        .await?;

        Ok(used.map(|(used,)| used).unwrap_or(0))
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_records (id, user_id, monitor_id, kind, timestamp, success) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.monitor_id)
        .bind(record.kind)
        .bind(record.timestamp)
        .bind(record.success)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageAggregate>> {
        let rows: Vec<(String, UsageKind, i64, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, kind, COUNT(*) AS total, COALESCE(SUM(success), 0) AS succeeded
            FROM usage_records
            WHERE timestamp >= ?
            GROUP BY user_id, kind
            ORDER BY user_id, kind
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, kind, total, succeeded)| UsageAggregate {
                user_id,
                kind,
                total: total.max(0) as u64,
                succeeded: succeeded.max(0) as u64,
            })
            .collect())
    }

    async fn upsert_error_log(&self, entry: &NewErrorLog, at: DateTime<Utc>) -> Result<ErrorLogEntry> {
        // Single statement, so concurrent repeats cannot race into two rows
        let row = sqlx::query_as::<_, ErrorLogEntry>(&format!(
            r#"
            INSERT INTO error_logs
                (level, source, message, error_type, stack_trace, context,
                 occurrence_count, first_occurrence, timestamp, resolved)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, 0)
            ON CONFLICT(level, source, message) WHERE resolved = 0 DO UPDATE SET
                occurrence_count = occurrence_count + 1,
                timestamp = excluded.timestamp,
                error_type = COALESCE(excluded.error_type, error_type),
                stack_trace = COALESCE(excluded.stack_trace, stack_trace),
                context = COALESCE(excluded.context, context)
            RETURNING {}
            "#,
            ERROR_LOG_COLUMNS
        ))
        .bind(entry.level)
        .bind(&entry.source)
        .bind(&entry.message)
        .bind(&entry.error_type)
        .bind(&entry.stack_trace)
        .bind(entry.context_json())
        .bind(at)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_error_logs(&self, unresolved_only: bool) -> Result<Vec<ErrorLogEntry>> {
        let sql = if unresolved_only {
            format!("SELECT {} FROM error_logs WHERE resolved = 0 ORDER BY id", ERROR_LOG_COLUMNS)
        } else {
            format!("SELECT {} FROM error_logs ORDER BY id", ERROR_LOG_COLUMNS)
        };

        let rows = sqlx::query_as::<_, ErrorLogEntry>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn resolve_error_log(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE error_logs SET resolved = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource: format!("error log {}", id),
            });
        }

        Ok(())
    }
}
