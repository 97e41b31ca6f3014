use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;

use super::{ApiResponse, AppState, HttpError};
use crate::check_engine::CheckReport;
use crate::element_finder::SuggestionReport;
use crate::scheduler::SchedulerStats;

#[derive(Debug, Default, Deserialize)]
pub struct SuggestionParams {
    pub expected_text: Option<String>,
}

pub async fn check_monitor_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<CheckReport>>, HttpError> {
    if id.trim().is_empty() {
        return Err(HttpError::bad_request("Monitor ID is required"));
    }

    let report = state.engine.check_now(&id).await?;
    tracing::info!(
        monitor_id = %id,
        status = %report.status,
        changed = report.changed,
        "Checked monitor on demand"
    );

    Ok(Json(ApiResponse::success(report)))
}

pub async fn suggest_selectors(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SuggestionParams>,
) -> Result<Json<ApiResponse<SuggestionReport>>, HttpError> {
    if id.trim().is_empty() {
        return Err(HttpError::bad_request("Monitor ID is required"));
    }

    let expected = params
        .expected_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty());

    match state.engine.suggest_selectors(&id, expected).await {
        Ok(report) => {
            tracing::debug!(monitor_id = %id, suggestions = report.suggestions.len(), "Built selector suggestions");
            Ok(Json(ApiResponse::success(report)))
        }
        Err(e) => {
            tracing::warn!(monitor_id = %id, "Selector suggestion failed: {}", e);
            Err(e.into())
        }
    }
}

pub async fn get_scheduler_stats(State(state): State<AppState>) -> Json<ApiResponse<SchedulerStats>> {
    Json(ApiResponse::success(state.scheduler.stats().await))
}
