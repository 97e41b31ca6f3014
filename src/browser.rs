use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ScraperConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    Load,
    #[default]
    NetworkIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub url: String,
    pub wait_until: WaitUntil,
    pub timeout: Duration,
    /// Elements to click, in order, once the page has settled.
    pub click_selectors: Vec<String>,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            wait_until: WaitUntil::NetworkIdle,
            timeout,
            click_selectors: Vec::new(),
        }
    }

    pub fn with_click(mut self, selector: impl Into<String>) -> Self {
        self.click_selectors.push(selector.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub html: String,
    pub final_url: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Render timed out after {0:?}")]
    Timeout(Duration),

    #[error("Render failed: {0}")]
    Failed(String),
}

/// Headless-render capability: load a URL in a real browser and return the
/// resulting DOM.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedPage, RenderError>;
}

/// `Renderer` backed by a local Chrome through `headless_chrome`.
///
/// The browser is launched on first use and relaunched if a tab cannot be
/// opened on it any more.
#[derive(Clone)]
pub struct ChromeRenderer {
    inner: Arc<ChromeInner>,
}

struct ChromeInner {
    config: ScraperConfig,
    browser: Mutex<Option<Browser>>,
}

/// Shared by a render's async caller and its blocking worker, so the caller
/// can stop the worker and close its tab when it gives up.
const SETTLE_SLICE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct RenderSession {
    cancelled: AtomicBool,
    tab: Mutex<Option<Arc<Tab>>>,
}

impl RenderSession {
    /// Hands the worker's tab to the session. Returns false if the caller
    /// has already given up, in which case the tab is closed here.
    fn attach(&self, tab: Arc<Tab>) -> bool {
        let mut slot = self.tab.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            drop(slot);
            let _ = tab.close(true);
            return false;
        }
        *slot = Some(tab);
        true
    }

    fn detach(&self) -> Option<Arc<Tab>> {
        self.tab.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(tab) = self.detach() {
            debug!("Closing tab of abandoned render");
            if let Err(e) = tab.close(true) {
                debug!("Closing abandoned tab failed: {}", e);
            }
        }
    }

    /// Sleeps in short slices so an abandoned render stops promptly.
    fn settle(&self, duration: Duration) -> Result<(), RenderError> {
        let until = std::time::Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let left = until.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(SETTLE_SLICE));
        }
    }

    fn checkpoint(&self) -> Result<(), RenderError> {
        if self.is_cancelled() {
            return Err(RenderError::Failed("Render abandoned by caller".to_string()));
        }
        Ok(())
    }
}

/// Cancels the session when the render future finishes or is dropped.
struct CancelOnDrop(Arc<RenderSession>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl ChromeRenderer {
    pub fn new(config: ScraperConfig) -> Self {
        Self {
            inner: Arc::new(ChromeInner {
                config,
                browser: Mutex::new(None),
            }),
        }
    }
}

impl ChromeInner {
    fn launch(&self) -> Result<Browser, RenderError> {
        let mut options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false) // Often needed in containerized environments
            .args(vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-extensions"),
                OsStr::new("--disable-background-timer-throttling"),
                OsStr::new("--disable-renderer-backgrounding"),
            ])
            .build()
            .map_err(|e| RenderError::Failed(format!("Failed to create launch options: {}", e)))?;

        if let Some(chrome_path) = &self.config.chrome_path {
            options.path = Some(PathBuf::from(chrome_path));
        }

        Browser::new(options).map_err(|e| RenderError::Failed(format!("Failed to launch browser: {}", e)))
    }

    fn browser(&self) -> Result<Browser, RenderError> {
        let mut slot = self.browser.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(browser) = slot.as_ref() {
            return Ok(browser.clone());
        }

        debug!("Launching headless browser");
        let browser = self.launch()?;
        *slot = Some(browser.clone());
        Ok(browser)
    }

    fn discard_browser(&self) {
        let mut slot = self.browser.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    fn render_blocking(&self, request: &RenderRequest, session: &RenderSession) -> Result<RenderedPage, RenderError> {
        session.checkpoint()?;
        let browser = self.browser()?;
        let tab = match browser.new_tab() {
            Ok(tab) => tab,
            Err(e) => {
                warn!("Browser unusable, relaunching on next render: {}", e);
                self.discard_browser();
                return Err(RenderError::Failed(format!("Failed to create tab: {}", e)));
            }
        };
        if !session.attach(tab.clone()) {
            return Err(RenderError::Failed("Render abandoned by caller".to_string()));
        }

        tab.set_default_timeout(request.timeout);
        tab.set_user_agent(&self.config.user_agent, None, None)
            .map_err(|e| RenderError::Failed(format!("Failed to set user agent: {}", e)))?;

        let result = (|| -> Result<RenderedPage, RenderError> {
            tab.navigate_to(&request.url)
                .map_err(|e| RenderError::Failed(format!("Navigation failed: {}", e)))?;
            tab.wait_until_navigated()
                .map_err(|e| RenderError::Failed(format!("Page load failed: {}", e)))?;
            session.checkpoint()?;

            if request.wait_until == WaitUntil::NetworkIdle {
                session.settle(self.config.render_settle())?;
            }

            for selector in &request.click_selectors {
                session.checkpoint()?;
                match tab.find_element(selector) {
                    Ok(element) => {
                        if let Err(e) = element.click() {
                            debug!("Click on '{}' failed: {}", selector, e);
                        } else {
                            session.settle(self.config.render_settle())?;
                        }
                    }
                    Err(_) => debug!("Click target '{}' not present", selector),
                }
            }

            session.checkpoint()?;
            let html = tab
                .get_content()
                .map_err(|e| RenderError::Failed(format!("Failed to read page content: {}", e)))?;
            let final_url = match tab.get_url() {
                url if url.is_empty() => request.url.clone(),
                url => url,
            };

            Ok(RenderedPage { html, final_url })
        })();

        if session.detach().is_some() {
            let _ = tab.close(true);
        }
        result
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedPage, RenderError> {
        let inner = self.inner.clone();
        let owned = request.clone();
        let session = Arc::new(RenderSession::default());
        let worker_session = session.clone();
        // Also fires when an outer timeout drops this future mid-render
        let _guard = CancelOnDrop(session);

        let task = tokio::task::spawn_blocking(move || inner.render_blocking(&owned, &worker_session));

        match tokio::time::timeout(request.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(RenderError::Failed(format!("Render task failed: {}", join_error))),
            Err(_) => Err(RenderError::Timeout(request.timeout)),
        }
    }
}
