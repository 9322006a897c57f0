//! Log-shipping client for managed services.
//!
//! Services embed this client to forward their logs to the orchestrator's
//! ingest endpoint. Entries buffer locally and flush as one batch when
//! the buffer fills; `ERROR` and `CRITICAL` entries flush immediately.
//! Shipping is best-effort: a failed flush is reported through the local
//! logger and the entries are dropped rather than blocking the service.

use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::store::{LogBatch, LogLevel, NewLogEntry};

/// Entries buffered before a flush is forced.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Optional metadata attached to one log call.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    /// Structured context.
    pub context: Option<serde_json::Value>,
    /// Request-tracing id.
    pub trace_id: Option<String>,
    /// User that triggered the event.
    pub user_id: Option<String>,
}

/// Buffered client for the orchestrator's `POST /logs/ingest`.
pub struct LogShipper {
    service_name: String,
    ingest_url: String,
    hostname: String,
    process_id: i64,
    batch_size: usize,
    token: Option<String>,
    buffer: Mutex<Vec<NewLogEntry>>,
    http: reqwest::Client,
}

impl LogShipper {
    /// Create a shipper for `service_name` posting to the orchestrator at
    /// `helm_url`.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed, which is a
    /// deployment defect rather than a runtime condition.
    #[must_use]
    pub fn new(service_name: impl Into<String>, helm_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self {
            service_name: service_name.into(),
            ingest_url: format!("{}/logs/ingest", helm_url.trim_end_matches('/')),
            hostname: crate::config::detect_hostname(),
            process_id: i64::from(std::process::id()),
            batch_size: DEFAULT_BATCH_SIZE,
            token: None,
            buffer: Mutex::new(Vec::new()),
            http,
        }
    }

    /// Attach the bearer token used on ingest calls.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Override the buffer size before a forced flush.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Number of entries currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Buffer one entry; flushes when the buffer fills or the entry is
    /// `ERROR`/`CRITICAL`.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>, meta: LogContext) {
        let entry = NewLogEntry {
            level: level.as_str().to_string(),
            message: message.into(),
            timestamp: Some(Utc::now()),
            context: meta.context,
            trace_id: meta.trace_id,
            user_id: meta.user_id,
            hostname: Some(self.hostname.clone()),
            process_id: Some(self.process_id),
        };

        let should_flush = {
            let mut buffer = match self.buffer.lock() {
                Ok(b) => b,
                Err(_) => return,
            };
            buffer.push(entry);
            buffer.len() >= self.batch_size || level >= LogLevel::Error
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Buffer a `DEBUG` entry.
    pub async fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, LogContext::default()).await;
    }

    /// Buffer an `INFO` entry.
    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, LogContext::default()).await;
    }

    /// Buffer a `WARNING` entry.
    pub async fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message, LogContext::default()).await;
    }

    /// Ship an `ERROR` entry (flushes immediately).
    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, LogContext::default()).await;
    }

    /// Ship a `CRITICAL` entry (flushes immediately).
    pub async fn critical(&self, message: impl Into<String>) {
        self.log(LogLevel::Critical, message, LogContext::default()).await;
    }

    /// Send everything buffered as one batch. Best-effort: failures are
    /// reported locally and the batch is dropped.
    pub async fn flush(&self) {
        let logs: Vec<NewLogEntry> = {
            let mut buffer = match self.buffer.lock() {
                Ok(b) => b,
                Err(_) => return,
            };
            std::mem::take(&mut *buffer)
        };
        if logs.is_empty() {
            return;
        }

        let batch = LogBatch {
            service_name: self.service_name.clone(),
            logs,
        };

        let mut request = self.http.post(&self.ingest_url).json(&batch);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(
                    status = response.status().as_u16(),
                    dropped = batch.logs.len(),
                    "log shipping rejected"
                );
            }
            Err(e) => {
                warn!(dropped = batch.logs.len(), "log shipping failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffers_until_batch_size() {
        // Nothing listens on the URL; flushes fail silently, which is the
        // shipper's contract, so buffering behavior is still observable.
        let shipper = LogShipper::new("billing", "http://127.0.0.1:1").with_batch_size(3);

        shipper.info("one").await;
        shipper.info("two").await;
        assert_eq!(shipper.buffered(), 2);

        // Third entry crosses the threshold and triggers a (failing)
        // flush, emptying the buffer either way.
        shipper.info("three").await;
        assert_eq!(shipper.buffered(), 0);
    }

    #[tokio::test]
    async fn test_error_flushes_immediately() {
        let shipper = LogShipper::new("billing", "http://127.0.0.1:1").with_batch_size(100);
        shipper.info("routine").await;
        assert_eq!(shipper.buffered(), 1);

        shipper.error("boom").await;
        assert_eq!(shipper.buffered(), 0);
    }

    #[tokio::test]
    async fn test_flush_on_empty_buffer_is_noop() {
        let shipper = LogShipper::new("billing", "http://127.0.0.1:1");
        shipper.flush().await;
        assert_eq!(shipper.buffered(), 0);
    }
}
