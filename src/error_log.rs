use std::sync::Arc;
use tracing::error;

use crate::clock::Clock;
use crate::models::{ErrorLogEntry, NewErrorLog};
use crate::store::Store;

/// Writes operational failures to the deduplicated error log.
///
/// Never fails outward: if the store rejects the write, the entry goes to
/// the console instead.
#[derive(Clone)]
pub struct ErrorLogger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ErrorLogger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn log(&self, entry: NewErrorLog) -> Option<ErrorLogEntry> {
        match self.store.upsert_error_log(&entry, self.clock.now()).await {
            Ok(row) => {
                metrics::counter!("pagewatch_error_log_writes_total", "source" => entry.source.clone())
                    .increment(1);
                Some(row)
            }
            Err(e) => {
                error!(
                    level = ?entry.level,
                    source = %entry.source,
                    error_type = ?entry.error_type,
                    "{} (error log unavailable: {})",
                    entry.message,
                    e
                );
                None
            }
        }
    }
}
