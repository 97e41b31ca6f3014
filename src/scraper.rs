use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::browser::{RenderError, RenderRequest, RenderedPage, Renderer};
use crate::config::{RenderEscalation, ScraperConfig};
use crate::consent::{find_challenge, ConsentHandler, Reconciliation};
use crate::models::{Tier, UsageKind};
use crate::quota::QuotaTracker;
use crate::utils::dom::{looks_client_rendered, text_content};
use crate::utils::Result;

/// Statuses whose bodies are still worth reading: they are usually bot
/// walls rather than real errors.
const CHALLENGE_STATUSES: &[u16] = &[403, 429, 503];

/// Slack on top of the renderer's own deadline before we give up on it.
const RENDER_DEADLINE_SLACK: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Render quota exhausted")]
    RenderQuotaExhausted,

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Invalid selector '{0}'")]
    InvalidSelector(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RenderError> for ExtractError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Timeout(after) => ExtractError::Timeout(after),
            RenderError::Failed(message) => ExtractError::Render(message),
        }
    }
}

/// Whose quota pays for a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderAccount {
    pub user_id: String,
    pub monitor_id: Option<String>,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Extraction {
    pub dom_snapshot: String,
    pub final_url: String,
    pub matched_text: Option<String>,
    pub match_count: usize,
    pub render_used: bool,
    /// Present whenever the DOM was inspected for consent overlays or
    /// challenges.
    pub reconciliation: Option<Reconciliation>,
}

/// A page fetched for offline analysis rather than a check.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub dom: String,
    pub final_url: String,
    pub render_used: bool,
    pub block_reason: Option<String>,
}

/// What a selector sees in a DOM, computed without holding the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomSample {
    pub match_count: usize,
    pub first_text: Option<String>,
    pub challenge: Option<String>,
    pub client_rendered: bool,
}

pub fn sample_dom(dom: &str, selector: &str) -> std::result::Result<DomSample, ExtractError> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(dom);

    let mut matches = document.select(&parsed);
    let first_text = matches.next().map(text_content);
    let match_count = if first_text.is_some() { 1 + matches.count() } else { 0 };

    Ok(DomSample {
        match_count,
        first_text,
        challenge: find_challenge(&document),
        client_rendered: looks_client_rendered(&document),
    })
}

fn parse_selector(selector: &str) -> std::result::Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|_| ExtractError::InvalidSelector(selector.to_string()))
}

struct StaticPage {
    status: StatusCode,
    body: String,
    final_url: String,
}

/// Fetches pages statically first and escalates to the headless renderer
/// when the static DOM is not trustworthy.
pub struct Extractor {
    client: reqwest::Client,
    renderer: Arc<dyn Renderer>,
    quota: Arc<QuotaTracker>,
    consent: ConsentHandler,
    config: ScraperConfig,
}

impl Extractor {
    pub fn new(config: ScraperConfig, renderer: Arc<dyn Renderer>, quota: Arc<QuotaTracker>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.static_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self {
            client,
            renderer,
            quota,
            consent: ConsentHandler::new(),
            config,
        })
    }

    /// Extracts the text of the first element `selector` matches on `url`.
    ///
    /// Rendering is only attempted when `render` names an account to
    /// charge it to.
    pub async fn extract(
        &self,
        url: &str,
        selector: &str,
        render: Option<&RenderAccount>,
    ) -> std::result::Result<Extraction, ExtractError> {
        parse_selector(selector)?;

        let page = self.fetch_static(url).await?;
        let status_ok = page.status.is_success();
        let sample = sample_dom(&page.body, selector)?;

        let needs_render = !status_ok
            || sample.challenge.is_some()
            || (sample.match_count == 0 && self.should_escalate_miss(&sample));

        debug!(
            url,
            status = page.status.as_u16(),
            matches = sample.match_count,
            challenge = sample.challenge.is_some(),
            needs_render,
            "Static pass complete"
        );

        if !needs_render {
            return Ok(Extraction {
                dom_snapshot: page.body,
                final_url: page.final_url,
                matched_text: sample.first_text,
                match_count: sample.match_count,
                render_used: false,
                reconciliation: None,
            });
        }

        let Some(account) = render else {
            return self.without_render(page, sample);
        };

        if !self.consume_render(account).await? {
            // A static challenge is still a reliable "blocked" verdict
            if sample.challenge.is_some() {
                return self.without_render(page, sample);
            }
            return Err(ExtractError::RenderQuotaExhausted);
        }

        let (rendered, reconciliation) = match self.render_reconciled(url, account).await {
            Ok(rendered) => rendered,
            // The challenge the static pass saw was never got past
            Err(e) if sample.challenge.is_some() => {
                warn!(url, "Render behind a bot challenge failed: {}", e);
                return self.without_render(page, sample);
            }
            Err(e) => return Err(e),
        };
        let sample = sample_dom(&rendered.html, selector)?;

        Ok(Extraction {
            dom_snapshot: rendered.html,
            final_url: rendered.final_url,
            matched_text: sample.first_text,
            match_count: sample.match_count,
            render_used: true,
            reconciliation: Some(reconciliation),
        })
    }

    /// Fetches a DOM for selector analysis. Renders when the static body
    /// looks client-rendered or challenged and the account has quota.
    pub async fn fetch_dom(
        &self,
        url: &str,
        render: Option<&RenderAccount>,
    ) -> std::result::Result<FetchedPage, ExtractError> {
        let page = self.fetch_static(url).await?;
        let (client_rendered, challenge) = {
            let document = Html::parse_document(&page.body);
            (looks_client_rendered(&document), find_challenge(&document))
        };

        let wants_render = !page.status.is_success() || challenge.is_some() || client_rendered;

        if wants_render {
            if let Some(account) = render {
                if self.consume_render(account).await? {
                    match self.render_reconciled(url, account).await {
                        Ok((rendered, reconciliation)) => {
                            return Ok(FetchedPage {
                                dom: rendered.html,
                                final_url: rendered.final_url,
                                render_used: true,
                                block_reason: reconciliation.block_reason,
                            });
                        }
                        Err(e) if challenge.is_some() => {
                            warn!(url, "Render behind a bot challenge failed: {}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if challenge.is_none() && !page.status.is_success() {
            return Err(ExtractError::HttpStatus(page.status.as_u16()));
        }

        Ok(FetchedPage {
            dom: page.body,
            final_url: page.final_url,
            render_used: false,
            block_reason: challenge,
        })
    }

    fn should_escalate_miss(&self, sample: &DomSample) -> bool {
        match self.config.render_escalation {
            RenderEscalation::Always => true,
            RenderEscalation::Heuristic => sample.client_rendered,
        }
    }

    /// Outcome when the static pass needed a render that will not happen.
    fn without_render(&self, page: StaticPage, sample: DomSample) -> std::result::Result<Extraction, ExtractError> {
        if let Some(reason) = sample.challenge {
            return Ok(Extraction {
                dom_snapshot: page.body,
                final_url: page.final_url,
                matched_text: sample.first_text,
                match_count: sample.match_count,
                render_used: false,
                reconciliation: Some(Reconciliation {
                    consent_dismissed: false,
                    blocked: true,
                    block_reason: Some(reason),
                }),
            });
        }

        if !page.status.is_success() {
            return Err(ExtractError::HttpStatus(page.status.as_u16()));
        }

        Err(ExtractError::RenderQuotaExhausted)
    }

    async fn fetch_static(&self, url: &str) -> std::result::Result<StaticPage, ExtractError> {
        let started = Instant::now();
        let response = self.client.get(url).send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() && !CHALLENGE_STATUSES.contains(&status.as_u16()) {
            return Err(ExtractError::HttpStatus(status.as_u16()));
        }

        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        metrics::histogram!("pagewatch_static_fetch_duration_seconds").record(started.elapsed().as_secs_f64());

        Ok(StaticPage {
            status,
            body,
            final_url,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> ExtractError {
        if err.is_timeout() {
            ExtractError::Timeout(self.config.static_timeout())
        } else {
            ExtractError::Transport(err.to_string())
        }
    }

    async fn consume_render(&self, account: &RenderAccount) -> std::result::Result<bool, ExtractError> {
        self.quota
            .try_consume(UsageKind::Render, &account.user_id, account.tier)
            .await
            .map_err(|e| ExtractError::Internal(format!("Render quota check failed: {}", e)))
    }

    /// Renders `url`, dismissing a consent overlay with a second render
    /// when one is found and quota allows, then checks for challenges.
    async fn render_reconciled(
        &self,
        url: &str,
        account: &RenderAccount,
    ) -> std::result::Result<(RenderedPage, Reconciliation), ExtractError> {
        let request = RenderRequest::new(url, self.config.render_timeout());
        let mut page = self.render_metered(&request, account).await?;
        let mut consent_dismissed = false;

        if let Some(signature) = self.consent.inspect(&page.html).consent {
            debug!(url, overlay = signature.name, "Consent overlay detected");
            if self.consume_render(account).await? {
                let request = request.clone().with_click(signature.accept);
                match self.render_metered(&request, account).await {
                    Ok(accepted) => {
                        consent_dismissed = self.consent.inspect(&accepted.html).consent.is_none();
                        page = accepted;
                    }
                    Err(e) => warn!("Re-render to dismiss {} overlay failed: {}", signature.name, e),
                }
            }
        }

        let reconciliation = self.consent.reconcile(&page.html, consent_dismissed);
        Ok((page, reconciliation))
    }

    async fn render_metered(
        &self,
        request: &RenderRequest,
        account: &RenderAccount,
    ) -> std::result::Result<RenderedPage, ExtractError> {
        let started = Instant::now();
        let deadline = request.timeout + RENDER_DEADLINE_SLACK;

        let result = match tokio::time::timeout(deadline, self.renderer.render(request)).await {
            Ok(result) => result.map_err(ExtractError::from),
            Err(_) => Err(ExtractError::Timeout(deadline)),
        };

        self.quota
            .record_usage(
                UsageKind::Render,
                &account.user_id,
                account.monitor_id.as_deref(),
                result.is_ok(),
            )
            .await;

        metrics::histogram!("pagewatch_render_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("pagewatch_renders_total", "success" => result.is_ok().to_string()).increment(1);

        result
    }
}
