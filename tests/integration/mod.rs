// Integration helpers shared by the PageWatch test suites

pub mod api_tests;
pub mod pipeline_tests;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};
pub use wiremock::MockServer;

use pagewatch::browser::{RenderError, RenderRequest, RenderedPage, Renderer};
use pagewatch::clock::ManualClock;
use pagewatch::models::{CheckFrequency, Monitor, NewMonitor, Tier, UserProfile};
use pagewatch::plugins::{ChangeNotification, NotificationResult, Notifier};
use pagewatch::store::{MemoryStore, Store};
use pagewatch::web::AppState;
use pagewatch::{AppConfig, CheckEngine, Scheduler};

pub const PRICE_PAGE_10: &str =
    r#"<html><head><title>Widget</title></head><body><h1>Widget</h1><span class="price">$10</span></body></html>"#;
pub const PRICE_PAGE_12: &str =
    r#"<html><head><title>Widget</title></head><body><h1>Widget</h1><span class="price">$12</span></body></html>"#;
pub const APP_SHELL: &str = r#"<html><head><title>Shop</title></head><body><div id="app"></div></body></html>"#;
pub const CLOUDFLARE_PAGE: &str = r#"<html><head><title>Just a moment...</title></head><body><span class="price">Checking your browser before accessing shop.example.com</span></body></html>"#;

/// What the scripted renderer does for a request.
pub enum RenderScript {
    Html(String),
    Fail(String),
    TimedOut,
    Panic,
    Hang,
}

type Script = Box<dyn Fn(&RenderRequest) -> RenderScript + Send + Sync>;

/// Renderer driven by a closure, recording what it was asked to do.
pub struct ScriptedRenderer {
    script: Script,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<RenderRequest>>,
}

impl ScriptedRenderer {
    pub fn new(script: impl Fn(&RenderRequest) -> RenderScript + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn serving(html: &str) -> Self {
        let html = html.to_string();
        Self::new(move |_| RenderScript::Html(html.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RenderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedPage, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match (self.script)(request) {
            RenderScript::Html(html) => Ok(RenderedPage {
                html,
                final_url: request.url.clone(),
            }),
            RenderScript::Fail(message) => Err(RenderError::Failed(message)),
            RenderScript::TimedOut => Err(RenderError::Timeout(request.timeout)),
            RenderScript::Panic => panic!("renderer crashed on {}", request.url),
            RenderScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RenderError::Timeout(Duration::from_secs(3600)))
            }
        }
    }
}

/// Notifier that records deliveries and can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<ChangeNotification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<ChangeNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, notification: &ChangeNotification) -> pagewatch::Result<NotificationResult> {
        if self.fail {
            return Ok(NotificationResult::failed("mailbox unavailable"));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(NotificationResult::sent(format!("msg-{}", notification.monitor_id)))
    }
}

pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Config tuned for fast, deterministic tests.
pub fn get_test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.scraper.static_timeout_ms = 2_000;
    config.scraper.render_timeout_ms = 1_000;
    config.scraper.render_settle_ms = 0;
    config.scheduler.check_timeout_secs = 10;
    config.scheduler.max_concurrent_checks = 2;
    config
}

/// Engine, scheduler and their collaborators over an in-memory store.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub renderer: Arc<ScriptedRenderer>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: Arc<CheckEngine>,
    pub scheduler: Arc<Scheduler>,
}

impl TestHarness {
    pub fn new(renderer: ScriptedRenderer) -> Self {
        Self::build(get_test_config(), renderer, RecordingNotifier::default())
    }

    pub fn build(config: AppConfig, renderer: ScriptedRenderer, notifier: RecordingNotifier) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(test_start()));
        let renderer = Arc::new(renderer);
        let notifier = Arc::new(notifier);

        let engine = Arc::new(
            CheckEngine::new(
                &config,
                store.clone(),
                renderer.clone(),
                notifier.clone(),
                clock.clone(),
            )
            .expect("engine"),
        );
        let scheduler = Arc::new(Scheduler::new(engine.clone(), clock.clone(), config.scheduler.clone()));

        Self {
            store,
            clock,
            renderer,
            notifier,
            engine,
            scheduler,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    pub async fn add_user(&self, user_id: &str, tier: Tier, email: Option<&str>) {
        self.store
            .upsert_user_profile(&UserProfile {
                user_id: user_id.to_string(),
                tier,
                email: email.map(str::to_string),
            })
            .await
            .unwrap();
    }

    pub async fn add_monitor(&self, user_id: &str, url: &str, selector: &str) -> Monitor {
        let monitor = Monitor::new(NewMonitor {
            user_id: user_id.to_string(),
            url: url.to_string(),
            selector: selector.to_string(),
            frequency: CheckFrequency::Hourly,
            email_enabled: None,
        });
        self.store.insert_monitor(&monitor).await.unwrap();
        monitor
    }

    pub async fn monitor(&self, id: &str) -> Monitor {
        self.store.get_monitor(id).await.unwrap().expect("monitor exists")
    }
}

/// Serves `html` at `route` with a 200.
pub async fn serve_html(server: &MockServer, route: &str, html: &str) {
    serve_status(server, route, 200, html).await;
}

pub async fn serve_status(server: &MockServer, route: &str, status: u16, html: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(status)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string(html),
        )
        .mount(server)
        .await;
}

/// Polls `condition` every 50ms until it holds or `timeout` passes.
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    false
}
