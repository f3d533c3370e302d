//! Programmatic entry point: push records, they get batched and exported.

use std::sync::Arc;

use thiserror::Error;

use crate::buffer::{BatchingEngine, EngineSettings, EngineStats};
use crate::config::Config;
use crate::exporter::{ExportError, LogExporter, OtlpExporter};
use crate::record::{Attributes, LogRecord, Severity};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to create exporter: {0}")]
    Exporter(#[from] ExportError),
}

/// Records pushed here are exported in the background. Delivery is best
/// effort: a failed batch is logged and discarded.
pub struct LogSink {
    engine: BatchingEngine,
}

impl LogSink {
    /// Build an OTLP exporter and start the batching engine.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        let exporter = OtlpExporter::new(config)?;
        Ok(Self::with_exporter(config, Arc::new(exporter)))
    }

    pub fn with_exporter(config: &Config, exporter: Arc<dyn LogExporter>) -> Self {
        let engine = BatchingEngine::start(EngineSettings::from_config(config), exporter, config.resource());
        Self { engine }
    }

    /// Queue a record. Returns `false` if it was dropped.
    pub fn log(&self, record: impl Into<Option<LogRecord>>) -> bool {
        self.engine.add(record)
    }

    /// Build and queue a record from a plain message and key/value tags.
    pub fn log_message(
        &self,
        time_unix_nano: u64,
        message: &str,
        severity: Severity,
        tags: &[(&str, &str)],
    ) -> bool {
        let attributes: Attributes = tags.iter().copied().collect();
        let record = LogRecord::new(message)
            .with_time(time_unix_nano)
            .with_severity(severity)
            .with_attributes(attributes);
        self.engine.add(record)
    }

    pub async fn flush(&self) {
        self.engine.flush().await;
    }

    /// Export everything queued and stop. Later `log` calls return `false`.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }
}
