use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::models::{CheckFrequency, Tier};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scraper: ScraperConfig,
    pub scheduler: SchedulerConfig,
    pub quota: QuotaConfig,
    pub tiers: TiersConfig,
    pub notifications: NotificationsConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
}

/// When a static selector miss escalates to a headless render.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderEscalation {
    /// Render on every static miss, quota permitting.
    #[default]
    Always,
    /// Render only when the static DOM looks client-rendered.
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub user_agent: String,
    pub static_timeout_ms: u64,
    pub render_timeout_ms: u64,
    pub render_settle_ms: u64,
    pub chrome_path: Option<String>,
    pub render_escalation: RenderEscalation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub max_concurrent_checks: usize,
    pub check_timeout_secs: u64,
}

/// System-wide caps shared by every user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub system_render_calls_per_month: u32,
    pub system_emails_per_day: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierLimits {
    pub min_frequency: CheckFrequency,
    pub render_calls_per_month: u32,
    pub emails_per_day: u32,
    pub pause_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub free: TierLimits,
    pub pro: TierLimits,
    pub power: TierLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotificationsConfig {
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: Option<String>,
    pub from_name: String,
    pub use_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://pagewatch.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: 30,
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Mozilla/5.0 (compatible; PageWatch/{})", env!("CARGO_PKG_VERSION")),
            static_timeout_ms: 10_000,
            render_timeout_ms: 30_000,
            render_settle_ms: 1_500,
            chrome_path: None,
            render_escalation: RenderEscalation::Always,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            max_concurrent_checks: 5,
            check_timeout_secs: 90,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            system_render_calls_per_month: 20_000,
            system_emails_per_day: 2_000,
        }
    }
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            free: TierLimits {
                min_frequency: CheckFrequency::Daily,
                render_calls_per_month: 30,
                emails_per_day: 10,
                pause_threshold: 3,
            },
            pro: TierLimits {
                min_frequency: CheckFrequency::Hourly,
                render_calls_per_month: 1_000,
                emails_per_day: 100,
                pause_threshold: 5,
            },
            power: TierLimits {
                min_frequency: CheckFrequency::Hourly,
                render_calls_per_month: 5_000,
                emails_per_day: 500,
                pause_threshold: 10,
            },
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 587,
            username: None,
            password: None,
            from_address: None,
            from_name: "PageWatch".to_string(),
            use_tls: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9001,
        }
    }
}

impl TiersConfig {
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Pro => &self.pro,
            Tier::Power => &self.power,
        }
    }
}

impl ScraperConfig {
    pub fn static_timeout(&self) -> Duration {
        Duration::from_millis(self.static_timeout_ms)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn render_settle(&self) -> Duration {
        Duration::from_millis(self.render_settle_ms)
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, ignored by git
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("PAGEWATCH").separator("__"))
            .build()?;

        Self::finish(s)
    }

    /// Defaults overlaid with a single file, then the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("PAGEWATCH").separator("__"))
            .build()?;

        Self::finish(s)
    }

    fn finish(s: Config) -> Result<Self, ConfigError> {
        let mut config: AppConfig = s.try_deserialize()?;

        if config.scraper.chrome_path.is_none() {
            config.scraper.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message("Server port must be greater than 0".into()));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Message("Database max_connections must be greater than 0".into()));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Message("Database min_connections cannot exceed max_connections".into()));
        }

        if self.scraper.static_timeout_ms == 0 || self.scraper.render_timeout_ms == 0 {
            return Err(ConfigError::Message("Scraper timeouts must be greater than 0".into()));
        }

        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::Message("Scheduler tick_interval_secs must be greater than 0".into()));
        }

        if self.scheduler.max_concurrent_checks == 0 {
            return Err(ConfigError::Message("Scheduler max_concurrent_checks must be greater than 0".into()));
        }

        if self.scheduler.check_timeout_secs == 0 {
            return Err(ConfigError::Message("Scheduler check_timeout_secs must be greater than 0".into()));
        }

        for (name, limits) in [("free", &self.tiers.free), ("pro", &self.tiers.pro), ("power", &self.tiers.power)] {
            if limits.pause_threshold == 0 {
                return Err(ConfigError::Message(format!(
                    "Tier {} pause_threshold must be greater than 0",
                    name
                )));
            }
        }

        if self.notifications.smtp.enabled && self.notifications.smtp.port == 0 {
            return Err(ConfigError::Message("SMTP port must be greater than 0".into()));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(ConfigError::Message("Metrics port must be greater than 0".into()));
        }

        Ok(())
    }
}
