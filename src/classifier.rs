use serde::{Deserialize, Serialize};

use crate::consent::Reconciliation;
use crate::models::CheckStatus;
use crate::scraper::{ExtractError, Extraction};

/// Outcome of one check. Only `Ok` carries a value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Classification {
    Ok { value: String },
    Blocked { reason: String },
    SelectorMissing { message: String },
    Error { message: String },
}

impl Classification {
    pub fn status(&self) -> CheckStatus {
        match self {
            Classification::Ok { .. } => CheckStatus::Ok,
            Classification::Blocked { .. } => CheckStatus::Blocked,
            Classification::SelectorMissing { .. } => CheckStatus::SelectorMissing,
            Classification::Error { .. } => CheckStatus::Error,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Classification::Ok { value } => Some(value),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Classification::Ok { .. } => None,
            Classification::Blocked { reason } => Some(reason),
            Classification::SelectorMissing { message } | Classification::Error { message } => Some(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Classification::Ok { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Classification::Error {
            message: message.into(),
        }
    }
}

/// Decides the outcome of a check. First match wins: blocked, extractor
/// failure, no match, then ok.
pub fn classify(
    result: &Result<Extraction, ExtractError>,
    reconciliation: Option<&Reconciliation>,
) -> Classification {
    if let Some(reconciliation) = reconciliation.filter(|r| r.blocked) {
        return Classification::Blocked {
            reason: reconciliation
                .block_reason
                .clone()
                .unwrap_or_else(|| "Bot challenge detected".to_string()),
        };
    }

    let extraction = match result {
        Ok(extraction) => extraction,
        Err(ExtractError::InvalidSelector(selector)) => {
            return Classification::error(format!("Selector '{}' is not valid CSS", selector));
        }
        Err(err) => return Classification::error(err.to_string()),
    };

    if extraction.match_count == 0 {
        let message = if extraction.render_used {
            "Selector matched nothing on the rendered page"
        } else {
            "Selector matched nothing on the page"
        };
        return Classification::SelectorMissing {
            message: message.to_string(),
        };
    }

    Classification::Ok {
        value: extraction
            .matched_text
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}
