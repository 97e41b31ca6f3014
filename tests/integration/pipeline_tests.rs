use super::*;
use pagewatch::models::{CheckStatus, LogLevel, Tier};
use pagewatch::AppError;

#[tokio::test]
async fn test_static_price_change_is_recorded_once() {
    let server = MockServer::start().await;
    serve_html(&server, "/widget", PRICE_PAGE_10).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/widget", server.uri()), ".price")
        .await;

    let first = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(first.status, CheckStatus::Ok);
    assert_eq!(first.current_value.as_deref(), Some("$10"));
    assert!(!first.changed);
    assert!(harness.store.list_changes(&monitor.id).await.unwrap().is_empty());

    server.reset().await;
    serve_html(&server, "/widget", PRICE_PAGE_12).await;

    let second = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(second.status, CheckStatus::Ok);
    assert!(second.changed);

    let changes = harness.store.list_changes(&monitor.id).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].old_value.as_deref(), Some("$10"));
    assert_eq!(changes[0].new_value, "$12");

    // Same value again is not a change
    let third = harness.engine.check_now(&monitor.id).await.unwrap();
    assert!(!third.changed);
    assert_eq!(harness.store.list_changes(&monitor.id).await.unwrap().len(), 1);
    assert_eq!(harness.renderer.calls(), 0);
}

#[tokio::test]
async fn test_app_shell_escalates_to_render_then_selector_missing() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    harness.add_user("alice", Tier::Pro, None).await;
    let mut monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    // Seed a previously observed value
    monitor.current_value = Some("$9".to_string());
    monitor.last_changed = Some(test_start());
    harness.store.save_monitor(&monitor).await.unwrap();

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::SelectorMissing);
    assert!(report.render_used);
    assert_eq!(harness.renderer.calls(), 1);

    let stored = harness.monitor(&monitor.id).await;
    assert_eq!(stored.current_value.as_deref(), Some("$9"));
    assert_eq!(stored.consecutive_failures, 1);
    assert_eq!(stored.last_status, Some(CheckStatus::SelectorMissing));
    assert!(harness.store.list_changes(&monitor.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rendered_content_is_extracted() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(PRICE_PAGE_12));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Ok);
    assert_eq!(report.current_value.as_deref(), Some("$12"));
    assert!(report.render_used);

    let usage = harness.engine.quota().usage_since(chrono::Duration::days(1)).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].total, 1);
    assert_eq!(usage[0].succeeded, 1);
}

#[tokio::test]
async fn test_rendered_cloudflare_challenge_is_blocked() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(CLOUDFLARE_PAGE));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Blocked);
    assert!(report.current_value.is_none());
    assert!(report.error.unwrap().contains("Cloudflare"));

    let logs = harness.store.list_error_logs(true).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Warning);
    assert_eq!(logs[0].error_type.as_deref(), Some("blocked"));
}

#[tokio::test]
async fn test_static_challenge_stays_blocked_when_render_fails() {
    let server = MockServer::start().await;
    serve_status(&server, "/guarded", 403, CLOUDFLARE_PAGE).await;

    let harness = TestHarness::new(ScriptedRenderer::new(|_| RenderScript::TimedOut));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/guarded", server.uri()), ".price")
        .await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Blocked);
    assert_eq!(harness.renderer.calls(), 1);
    assert!(report.current_value.is_none());

    // Suggestions see the same verdict
    let err = harness.engine.suggest_selectors(&monitor.id, None).await.unwrap_err();
    assert!(matches!(err, AppError::Blocked { .. }));
}

#[tokio::test]
async fn test_consent_overlay_is_dismissed_with_second_render() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let renderer = ScriptedRenderer::new(|request| {
        if request.click_selectors.is_empty() {
            RenderScript::Html(
                r#"<html><body><div id="onetrust-banner-sdk"><button id="onetrust-accept-btn-handler">Accept</button></div></body></html>"#
                    .to_string(),
            )
        } else {
            RenderScript::Html(r#"<html><body><span class="price">$15</span></body></html>"#.to_string())
        }
    });
    let harness = TestHarness::new(renderer);
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Ok);
    assert_eq!(report.current_value.as_deref(), Some("$15"));

    let requests = harness.renderer.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].click_selectors, vec!["#onetrust-accept-btn-handler".to_string()]);
}

#[tokio::test]
async fn test_three_errors_pause_free_monitor() {
    let server = MockServer::start().await;
    serve_status(&server, "/down", 500, "<html><body>oops</body></html>").await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    let monitor = harness
        .add_monitor("free-user", &format!("{}/down", server.uri()), ".price")
        .await;

    for attempt in 1..=3 {
        let report = harness.engine.check_now(&monitor.id).await.unwrap();
        assert_eq!(report.status, CheckStatus::Error);
        assert_eq!(report.paused, attempt == 3);
    }

    let stored = harness.monitor(&monitor.id).await;
    assert!(!stored.active);
    assert!(stored.pause_reason.as_deref().is_some_and(|reason| !reason.is_empty()));
    assert_eq!(stored.consecutive_failures, 3);

    // Same failure collapses into one log row
    let errors: Vec<_> = harness
        .store
        .list_error_logs(true)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].occurrence_count, 3);

    // Further checks never reactivate it
    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert!(!report.paused);
    assert!(!harness.monitor(&monitor.id).await.active);
}

#[tokio::test]
async fn test_exhausted_render_quota_is_an_error() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let mut config = get_test_config();
    config.tiers.free.render_calls_per_month = 0;
    let harness = TestHarness::build(config, ScriptedRenderer::serving(PRICE_PAGE_10), RecordingNotifier::default());
    let monitor = harness
        .add_monitor("free-user", &format!("{}/spa", server.uri()), ".price")
        .await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Error);
    assert!(report.error.unwrap().to_lowercase().contains("quota"));
    assert_eq!(harness.renderer.calls(), 0);
}

#[tokio::test]
async fn test_change_emails_owner() {
    let server = MockServer::start().await;
    serve_html(&server, "/widget", PRICE_PAGE_10).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    harness.add_user("alice", Tier::Pro, Some("alice@example.com")).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/widget", server.uri()), ".price")
        .await;

    let first = harness.engine.check_now(&monitor.id).await.unwrap();
    assert!(!first.notified);

    server.reset().await;
    serve_html(&server, "/widget", PRICE_PAGE_12).await;

    let second = harness.engine.check_now(&monitor.id).await.unwrap();
    assert!(second.notified);

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "alice@example.com");
    assert_eq!(sent[0].old_value.as_deref(), Some("$10"));
    assert_eq!(sent[0].new_value, "$12");
}

#[tokio::test]
async fn test_email_disabled_monitor_is_not_notified() {
    let server = MockServer::start().await;
    serve_html(&server, "/widget", PRICE_PAGE_10).await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    harness.add_user("alice", Tier::Pro, Some("alice@example.com")).await;
    let mut monitor = harness
        .add_monitor("alice", &format!("{}/widget", server.uri()), ".price")
        .await;
    monitor.email_enabled = false;
    harness.store.save_monitor(&monitor).await.unwrap();

    harness.engine.check_now(&monitor.id).await.unwrap();
    server.reset().await;
    serve_html(&server, "/widget", PRICE_PAGE_12).await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert!(report.changed);
    assert!(!report.notified);
    assert!(harness.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_check() {
    let server = MockServer::start().await;
    serve_html(&server, "/widget", PRICE_PAGE_10).await;

    let harness = TestHarness::build(
        get_test_config(),
        ScriptedRenderer::serving(APP_SHELL),
        RecordingNotifier::failing(),
    );
    harness.add_user("alice", Tier::Pro, Some("alice@example.com")).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/widget", server.uri()), ".price")
        .await;

    harness.engine.check_now(&monitor.id).await.unwrap();
    server.reset().await;
    serve_html(&server, "/widget", PRICE_PAGE_12).await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Ok);
    assert!(report.changed);
    assert!(!report.notified);

    let logs = harness.store.list_error_logs(true).await.unwrap();
    assert!(logs.iter().any(|entry| entry.error_type.as_deref() == Some("notification")));
}

#[tokio::test]
async fn test_renderer_panic_is_contained() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let harness = TestHarness::new(ScriptedRenderer::new(|_| RenderScript::Panic));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Error);
    assert!(report.error.unwrap().contains("renderer crashed"));
    assert_eq!(harness.monitor(&monitor.id).await.consecutive_failures, 1);

    let logs = harness.store.list_error_logs(true).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].stack_trace.as_deref().unwrap_or_default().contains("renderer crashed"));
}

#[tokio::test]
async fn test_hung_render_times_out() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let mut config = get_test_config();
    config.scheduler.check_timeout_secs = 1;
    let harness = TestHarness::build(
        config,
        ScriptedRenderer::new(|_| RenderScript::Hang),
        RecordingNotifier::default(),
    );
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    let started = std::time::Instant::now();
    let report = harness.engine.check_now(&monitor.id).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.status, CheckStatus::Error);
    assert!(report.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_render_failure_is_an_error() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let harness = TestHarness::new(ScriptedRenderer::new(|_| RenderScript::Fail("chrome exited".to_string())));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    let report = harness.engine.check_now(&monitor.id).await.unwrap();
    assert_eq!(report.status, CheckStatus::Error);
    assert!(report.error.unwrap().contains("chrome exited"));

    let usage = harness.engine.quota().usage_since(chrono::Duration::days(1)).await.unwrap();
    assert_eq!(usage[0].succeeded, 0);
}

#[tokio::test]
async fn test_check_now_unknown_monitor() {
    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    let err = harness.engine.check_now("missing").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn test_suggestions_for_broken_selector() {
    let server = MockServer::start().await;
    let page = r#"<html><body><div class="product"><h1>Widget</h1><span class="amount">$10</span></div></body></html>"#;
    serve_html(&server, "/widget", page).await;

    // Short pages read as client-rendered, so the renderer sees the same DOM
    let harness = TestHarness::new(ScriptedRenderer::serving(page));
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/widget", server.uri()), ".price")
        .await;

    let report = harness.engine.suggest_selectors(&monitor.id, Some("$10")).await.unwrap();
    assert_eq!(report.current_selector_info.count, 0);
    assert!(report
        .suggestions
        .iter()
        .any(|suggestion| suggestion.sample_text == "$10" && suggestion.match_count == 1));

    // Deterministic for an unchanged page
    let again = harness.engine.suggest_selectors(&monitor.id, Some("$10")).await.unwrap();
    assert_eq!(report, again);
}

#[tokio::test]
async fn test_suggestions_surface_fetch_failure() {
    let server = MockServer::start().await;
    serve_status(&server, "/down", 500, "oops").await;

    let harness = TestHarness::new(ScriptedRenderer::serving(APP_SHELL));
    let monitor = harness
        .add_monitor("alice", &format!("{}/down", server.uri()), ".price")
        .await;

    let err = harness.engine.suggest_selectors(&monitor.id, None).await.unwrap_err();
    assert!(matches!(err, AppError::Scraping(_)));
}

#[tokio::test]
async fn test_reactivation_during_check_is_kept() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let renderer = ScriptedRenderer::serving(PRICE_PAGE_10).with_delay(Duration::from_millis(400));
    let harness = TestHarness::new(renderer);
    harness.add_user("alice", Tier::Pro, None).await;
    let mut monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;
    monitor.active = false;
    monitor.consecutive_failures = 3;
    monitor.pause_reason = Some("Paused after 3 consecutive failed checks".to_string());
    harness.store.save_monitor(&monitor).await.unwrap();

    let owner_edit = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut current = harness.monitor(&monitor.id).await;
        current.reactivate();
        harness.store.save_monitor(&current).await.unwrap();
    };
    let (report, ()) = tokio::join!(harness.engine.check_now(&monitor.id), owner_edit);

    assert_eq!(report.unwrap().status, CheckStatus::Ok);
    let stored = harness.monitor(&monitor.id).await;
    assert!(stored.active);
    assert!(stored.pause_reason.is_none());
    assert_eq!(stored.consecutive_failures, 0);
    assert_eq!(stored.current_value.as_deref(), Some("$10"));
}

#[tokio::test]
async fn test_pause_during_check_is_kept() {
    let server = MockServer::start().await;
    serve_html(&server, "/spa", APP_SHELL).await;

    let renderer = ScriptedRenderer::serving(PRICE_PAGE_10).with_delay(Duration::from_millis(400));
    let harness = TestHarness::new(renderer);
    harness.add_user("alice", Tier::Pro, None).await;
    let monitor = harness
        .add_monitor("alice", &format!("{}/spa", server.uri()), ".price")
        .await;

    let owner_edit = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut current = harness.monitor(&monitor.id).await;
        current.active = false;
        current.pause_reason = Some("Paused by owner".to_string());
        harness.store.save_monitor(&current).await.unwrap();
    };
    let (report, ()) = tokio::join!(harness.engine.check_now(&monitor.id), owner_edit);

    assert_eq!(report.unwrap().status, CheckStatus::Ok);
    let stored = harness.monitor(&monitor.id).await;
    assert!(!stored.active);
    assert_eq!(stored.pause_reason.as_deref(), Some("Paused by owner"));
    assert_eq!(stored.current_value.as_deref(), Some("$10"));
}
