use super::*;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use pagewatch::models::Tier;
use pagewatch::web::create_router;
use serde_json::Value;
use tower::ServiceExt;

async fn send(harness: &TestHarness, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = create_router(harness.app_state())
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_check() {
    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    let (status, body) = send(&harness, Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_check_now_endpoint() {
    let server = MockServer::start().await;
    serve_html(&server, "/widget", PRICE_PAGE_10).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/widget", server.uri()), ".price")
        .await;

    let (status, body) = send(&harness, Method::POST, &format!("/api/v1/monitors/{}/check", monitor.id)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["current_value"], "$10");
    assert_eq!(body["data"]["changed"], false);
}

#[tokio::test]
async fn test_check_now_unknown_monitor_is_404() {
    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    let (status, body) = send(&harness, Method::POST, "/api/v1/monitors/nope/check").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_suggestions_endpoint() {
    let server = MockServer::start().await;
    let page = r#"<html><body><main><span class="amount">$10</span></main></body></html>"#;
    serve_html(&server, "/widget", page).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(page));
    let monitor = harness
        .add_monitor("alice", &format!("{}/widget", server.uri()), ".price")
        .await;

    let (status, body) = send(
        &harness,
        Method::GET,
        &format!("/api/v1/monitors/{}/suggestions?expected_text=%2410", monitor.id),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["current_selector_info"]["count"], 0);
    assert!(!body["data"]["suggestions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_suggestions_upstream_failure_is_502() {
    let server = MockServer::start().await;
    serve_status(&server, "/down", 500, "oops").await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    let monitor = harness
        .add_monitor("alice", &format!("{}/down", server.uri()), ".price")
        .await;

    let (status, body) = send(&harness, Method::GET, &format!("/api/v1/monitors/{}/suggestions", monitor.id)).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "UPSTREAM_FAILED");
}

#[tokio::test]
async fn test_scheduler_stats_endpoint() {
    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    harness.scheduler.run_tick().await.unwrap();

    let (status, body) = send(&harness, Method::GET, "/api/v1/scheduler/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ticks"], 1);
}
