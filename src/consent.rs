//! Cookie-consent overlay and bot-challenge detection over rendered DOM.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::utils::dom::visible_text;

/// A known consent-management overlay: how to spot it and what to click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentSignature {
    pub name: &'static str,
    pub detect: &'static str,
    pub accept: &'static str,
}

pub const CONSENT_SIGNATURES: &[ConsentSignature] = &[
    ConsentSignature {
        name: "OneTrust",
        detect: "#onetrust-banner-sdk, #onetrust-consent-sdk",
        accept: "#onetrust-accept-btn-handler",
    },
    ConsentSignature {
        name: "Cookiebot",
        detect: "#CybotCookiebotDialog",
        accept: "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll, #CybotCookiebotDialogBodyButtonAccept",
    },
    ConsentSignature {
        name: "Didomi",
        detect: "#didomi-host, #didomi-popup",
        accept: "#didomi-notice-agree-button",
    },
    ConsentSignature {
        name: "Quantcast",
        detect: ".qc-cmp2-container, #qc-cmp2-ui",
        accept: ".qc-cmp2-summary-buttons button[mode=\"primary\"]",
    },
    ConsentSignature {
        name: "TrustArc",
        detect: "#truste-consent-track, .truste_overlay",
        accept: "#truste-consent-button",
    },
    ConsentSignature {
        name: "Usercentrics",
        detect: "#usercentrics-root, #uc-banner",
        accept: "[data-testid=\"uc-accept-all-button\"]",
    },
    ConsentSignature {
        name: "generic",
        detect: "#cookie-consent, .cookie-consent, .cookie-banner, #cookie-banner",
        accept: "#cookie-consent button, .cookie-consent button, .cookie-banner button, #cookie-banner button",
    },
];

/// Elements that only appear on challenge interstitials.
const CHALLENGE_SELECTORS: &[(&str, &str)] = &[
    ("#challenge-form", "Cloudflare challenge"),
    ("#cf-challenge-running", "Cloudflare challenge"),
    (".cf-browser-verification", "Cloudflare browser verification"),
    ("script[src*=\"challenge-platform\"]", "Cloudflare challenge"),
    ("#px-captcha", "PerimeterX captcha"),
    ("iframe[src*=\"captcha-delivery.com\"]", "DataDome captcha"),
];

/// Captcha widgets that count as a block only on an otherwise bare page.
const CAPTCHA_WIDGETS: &[(&str, &str)] = &[
    ("iframe[src*=\"hcaptcha.com\"], .h-captcha", "hCaptcha interstitial"),
    ("iframe[src*=\"recaptcha\"], .g-recaptcha", "reCAPTCHA interstitial"),
];

const CHALLENGE_TITLES: &[(&str, &str)] = &[
    ("just a moment...", "Cloudflare challenge"),
    ("attention required! | cloudflare", "Cloudflare block page"),
    ("access denied", "Access denied interstitial"),
    ("pardon our interruption", "Bot management interstitial"),
];

const CHALLENGE_TEXT: &[(&str, &str)] = &[
    ("checking your browser before accessing", "Cloudflare challenge"),
    ("enable javascript and cookies to continue", "Cloudflare challenge"),
    ("please verify you are a human", "Human verification interstitial"),
];

const BARE_PAGE_CHARS: usize = 400;

/// What the handler concluded about a rendered page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconciliation {
    pub consent_dismissed: bool,
    pub blocked: bool,
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInspection {
    pub consent: Option<ConsentSignature>,
    pub challenge: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConsentHandler;

impl ConsentHandler {
    pub fn new() -> Self {
        Self
    }

    /// Looks for a consent overlay and a challenge signature in one parse.
    pub fn inspect(&self, dom: &str) -> PageInspection {
        let document = Html::parse_document(dom);
        PageInspection {
            consent: find_consent(&document),
            challenge: find_challenge(&document),
        }
    }

    /// Outcome for a page after any consent dismissal has already happened.
    pub fn reconcile(&self, dom: &str, consent_dismissed: bool) -> Reconciliation {
        let inspection = self.inspect(dom);
        Reconciliation {
            consent_dismissed,
            blocked: inspection.challenge.is_some(),
            block_reason: inspection.challenge,
        }
    }

    pub fn challenge_reason(&self, dom: &str) -> Option<String> {
        find_challenge(&Html::parse_document(dom))
    }
}

fn matches_any(document: &Html, selector: &str) -> bool {
    Selector::parse(selector)
        .map(|parsed| document.select(&parsed).next().is_some())
        .unwrap_or(false)
}

fn find_consent(document: &Html) -> Option<ConsentSignature> {
    CONSENT_SIGNATURES
        .iter()
        .find(|signature| matches_any(document, signature.detect))
        .copied()
}

pub(crate) fn find_challenge(document: &Html) -> Option<String> {
    if let Some((_, reason)) = CHALLENGE_SELECTORS
        .iter()
        .find(|(selector, _)| matches_any(document, selector))
    {
        return Some(reason.to_string());
    }

    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .map(|title| title.text().collect::<String>().trim().to_lowercase())
        .unwrap_or_default();

    if let Some((_, reason)) = CHALLENGE_TITLES.iter().find(|(marker, _)| title == *marker) {
        return Some(reason.to_string());
    }

    let body_text = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .map(visible_text)
        .unwrap_or_default();
    let lowered = body_text.to_lowercase();

    if let Some((_, reason)) = CHALLENGE_TEXT.iter().find(|(marker, _)| lowered.contains(marker)) {
        return Some(reason.to_string());
    }

    if body_text.chars().count() < BARE_PAGE_CHARS {
        if let Some((_, reason)) = CAPTCHA_WIDGETS
            .iter()
            .find(|(selector, _)| matches_any(document, selector))
        {
            return Some(reason.to_string());
        }
    }

    None
}
