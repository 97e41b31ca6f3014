use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pagewatch::browser::ChromeRenderer;
use pagewatch::clock::{Clock, SystemClock};
use pagewatch::plugins::{EmailNotifier, NoopNotifier, Notifier};
use pagewatch::store::{SqliteStore, Store};
use pagewatch::web::{self, AppState};
use pagewatch::{AppConfig, CheckEngine, Scheduler};

#[derive(Parser)]
#[command(name = "pagewatch", version, about = "Watch web pages for changes")]
struct Cli {
    /// Config file; defaults to config/{default,$RUN_MODE,local} plus env
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the HTTP API
    Serve,
    /// Run a single scheduler tick and print the report
    Tick,
    /// Check one monitor now
    Check { monitor_id: String },
    /// Suggest alternative selectors for a monitor
    Suggest {
        monitor_id: String,
        #[arg(long)]
        expected_text: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing()?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::from_env(),
    }
    .context("Failed to load configuration")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::connect(&config.database)
            .await
            .context("Failed to open database")?,
    );
    let renderer = Arc::new(ChromeRenderer::new(config.scraper.clone()));
    let notifier: Arc<dyn Notifier> = match EmailNotifier::from_config(&config.notifications.smtp)? {
        Some(email) => Arc::new(email),
        None => {
            info!("SMTP not configured, change emails disabled");
            Arc::new(NoopNotifier)
        }
    };

    let engine = Arc::new(CheckEngine::new(&config, store, renderer, notifier, clock.clone())?);
    let scheduler = Arc::new(Scheduler::new(engine.clone(), clock, config.scheduler.clone()));

    match cli.command {
        Command::Serve => serve(config, engine, scheduler).await,
        Command::Tick => {
            let report = scheduler.run_tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Check { monitor_id } => {
            let report = engine.check_now(&monitor_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Suggest {
            monitor_id,
            expected_text,
        } => {
            let report = engine
                .suggest_selectors(&monitor_id, expected_text.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig, engine: Arc<CheckEngine>, scheduler: Arc<Scheduler>) -> Result<()> {
    if config.metrics.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start metrics exporter")?;
        info!("Prometheus metrics on {}", addr);
    }

    info!("Starting PageWatch...");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));
    let state = AppState { engine, scheduler };
    let server_task = tokio::spawn({
        let server = config.server.clone();
        async move { web::serve(&server, state, shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown_tx.send(true).ok();

    scheduler_task.await?;
    server_task.await??;

    Ok(())
}

/// Console logging, plus a daily rolling file when `PAGEWATCH_LOG_DIR` is set.
fn init_tracing() -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("pagewatch=info,tower_http=info"))?;
    let console = fmt::layer().with_target(true);

    match std::env::var("PAGEWATCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pagewatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}
