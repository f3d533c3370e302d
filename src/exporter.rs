//! HTTP exporter for shipping log batches to an OTLP/HTTP backend.
//!
//! The exporter reuses one reqwest client (and its connection pool) for every
//! request. It offers two transmission modes:
//!
//! - [`OtlpExporter::send_blocking`]: awaits the response, bounded by the
//!   configured request timeout, and returns a definite result. The file
//!   tailer relies on this before advancing a checkpoint.
//! - [`OtlpExporter::send_async`]: fire-and-forget; the request runs on its
//!   own task and the outcome is only logged.
//!
//! The exporter never retries on its own; retry policy belongs to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::envelope::{build_request, encode_gzip};
use crate::record::{Batch, ResourceContext};

pub const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

/// Errors that can occur while exporting a batch.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Serializing or compressing the envelope failed
    #[error("Failed to encode export request: {0}")]
    Encode(String),

    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Server answered with a non-2xx status code
    #[error("Server returned status {code}")]
    Status { code: StatusCode },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Client(String),
}

impl From<reqwest::Error> for ExportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExportError::Timeout
        } else {
            ExportError::Request(err)
        }
    }
}

/// Destination for batches of records.
///
/// Implementations must be safe to share between the batching engine and
/// every tailer task.
#[async_trait]
pub trait LogExporter: Send + Sync {
    /// Ship one batch and report whether the backend accepted it.
    async fn export(&self, batch: &Batch, resource: &ResourceContext) -> Result<(), ExportError>;
}

/// Counters describing exporter activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportStats {
    /// Total number of batches accepted by the backend
    pub batches_sent: u64,

    /// Total number of records in accepted batches
    pub records_sent: u64,

    /// Total number of batches that failed
    pub batches_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches_sent: AtomicU64,
    records_sent: AtomicU64,
    batches_failed: AtomicU64,
}

/// OTLP/HTTP exporter: protobuf envelope, gzip body, API-key header.
#[derive(Clone)]
pub struct OtlpExporter {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    endpoint: String,
    api_key_header: HeaderName,
    api_key: HeaderValue,

    /// Request timeout duration
    timeout: Duration,

    counters: Arc<Counters>,
}

impl std::fmt::Debug for OtlpExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtlpExporter")
            .field("endpoint", &self.endpoint)
            .field("api_key_header", &self.api_key_header)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OtlpExporter {
    /// Create a new exporter from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ExportError::Client` if the header name or key are not valid
    /// HTTP header material, or the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ExportError> {
        Self::with_settings(
            config.otlp_endpoint(),
            config.api_key_header(),
            config.api_key(),
            config.request_timeout(),
        )
    }

    /// Create an exporter with explicit settings.
    pub fn with_settings(
        endpoint: impl Into<String>,
        api_key_header: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ExportError> {
        let api_key_header = HeaderName::from_bytes(api_key_header.as_bytes())
            .map_err(|e| ExportError::Client(format!("invalid API key header name: {}", e)))?;
        let mut api_key = HeaderValue::from_str(api_key)
            .map_err(|e| ExportError::Client(format!("invalid API key: {}", e)))?;
        api_key.set_sensitive(true);

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ExportError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key_header,
            api_key,
            timeout,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Send a batch and wait for the backend's verdict.
    ///
    /// The whole exchange is bounded by the configured timeout, so a hung
    /// connection cannot stall the caller indefinitely.
    pub async fn send_blocking(
        &self,
        batch: &Batch,
        resource: &ResourceContext,
    ) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = encode_gzip(&build_request(&batch.records, resource))
            .map_err(|e| ExportError::Encode(e.to_string()))?;

        debug!(
            batch_id = %batch.batch_id,
            records = batch.len(),
            bytes = body.len(),
            endpoint = %self.endpoint,
            "Sending log batch"
        );

        let result = match tokio::time::timeout(self.timeout, self.post(body)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout),
        };

        match &result {
            Ok(()) => {
                self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .records_sent
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(batch_id = %batch.batch_id, records = batch.len(), "Log batch accepted");
            }
            Err(e) => {
                self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                warn!(batch_id = %batch.batch_id, records = batch.len(), error = %e, "Log batch export failed");
            }
        }

        result
    }

    /// Fire-and-forget send. The returned handle resolves to whether the
    /// backend accepted the batch; dropping it is fine.
    pub fn send_async(&self, batch: Batch, resource: ResourceContext) -> JoinHandle<bool> {
        let exporter = self.clone();
        tokio::spawn(async move { exporter.send_blocking(&batch, &resource).await.is_ok() })
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), ExportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(self.api_key_header.clone(), self.api_key.clone())
            .header(CONTENT_TYPE, CONTENT_TYPE_PROTOBUF)
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ExportError::Status { code: status })
        }
    }

    /// Get the configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> ExportStats {
        ExportStats {
            batches_sent: self.counters.batches_sent.load(Ordering::Relaxed),
            records_sent: self.counters.records_sent.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl LogExporter for OtlpExporter {
    async fn export(&self, batch: &Batch, resource: &ResourceContext) -> Result<(), ExportError> {
        self.send_blocking(batch, resource).await
    }
}
