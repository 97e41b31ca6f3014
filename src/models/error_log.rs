use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
}

/// Operational log row. At most one unresolved row exists per
/// (level, source, message); repeats bump `occurrence_count`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ErrorLogEntry {
    pub id: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub error_type: Option<String>,
    pub stack_trace: Option<String>,
    pub context: Option<String>, // JSON document
    pub occurrence_count: u32,
    pub first_occurrence: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewErrorLog {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub error_type: Option<String>,
    pub stack_trace: Option<String>,
    pub context: Option<serde_json::Value>,
}

impl NewErrorLog {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.into(),
            message: message.into(),
            error_type: None,
            stack_trace: None,
            context: None,
        }
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, source, message)
    }

    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, source, message)
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn context_json(&self) -> Option<String> {
        self.context.as_ref().map(|value| value.to_string())
    }

    /// First row for this key.
    pub fn into_entry(self, id: i64, at: DateTime<Utc>) -> ErrorLogEntry {
        let context = self.context_json();
        ErrorLogEntry {
            id,
            level: self.level,
            source: self.source,
            message: self.message,
            error_type: self.error_type,
            stack_trace: self.stack_trace,
            context,
            occurrence_count: 1,
            first_occurrence: at,
            timestamp: at,
            resolved: false,
        }
    }
}

impl ErrorLogEntry {
    pub fn matches(&self, entry: &NewErrorLog) -> bool {
        !self.resolved
            && self.level == entry.level
            && self.source == entry.source
            && self.message == entry.message
    }

    /// Fold a repeat occurrence into this row.
    pub fn record_repeat(&mut self, entry: &NewErrorLog, at: DateTime<Utc>) {
        self.occurrence_count = self.occurrence_count.saturating_add(1);
        self.timestamp = at;
        if entry.error_type.is_some() {
            self.error_type = entry.error_type.clone();
        }
        if entry.stack_trace.is_some() {
            self.stack_trace = entry.stack_trace.clone();
        }
        if entry.context.is_some() {
            self.context = entry.context_json();
        }
    }
}
