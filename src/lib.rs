pub mod browser;
pub mod change_detector;
pub mod check_engine;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod consent;
pub mod element_finder;
pub mod error_log;
pub mod models;
pub mod plugins;
pub mod quota;
pub mod scheduler;
pub mod scraper;
pub mod store;
pub mod utils;
pub mod web;

// Re-export commonly used types
pub use check_engine::{CheckEngine, CheckReport};
pub use classifier::Classification;
pub use config::AppConfig;
pub use scheduler::{Scheduler, SchedulerStats, TickReport};
pub use utils::{AppError, Result};
