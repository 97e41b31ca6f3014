use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::check_engine::CheckEngine;
use crate::config::ServerConfig;
use crate::scheduler::Scheduler;

pub mod handlers;
pub mod responses;

pub use handlers::{check_monitor_now, get_scheduler_stats, suggest_selectors};
pub use responses::*;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CheckEngine>,
    pub scheduler: Arc<Scheduler>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/monitors/:id/check", post(check_monitor_now))
        .route("/monitors/:id/suggestions", get(suggest_selectors))
        .route("/scheduler/stats", get(get_scheduler_stats))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": "pagewatch"
    }))
}

/// Serves the API until `shutdown` flips to true.
pub async fn serve(config: &ServerConfig, state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;

    tracing::info!("Server starting on {}:{}", config.host, config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
