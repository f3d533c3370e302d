//! logsink Library
//!
//! This library ships log records to an OTLP/HTTP backend:
//!
//! - **record**: Log record, severity and resource data model
//! - **config**: Validated configuration from a builder or the environment
//! - **assembler**: Groups raw lines into multi-line records
//! - **checkpoint**: Crash-safe offsets and the list of in-progress files
//! - **tailer**: Reads one file from its checkpoint and exports it in order
//! - **supervisor**: Runs one tailer per file and resumes work after restarts
//! - **buffer**: Non-blocking batching engine for programmatic records
//! - **envelope**: OTLP request construction and gzip encoding
//! - **exporter**: HTTP transport with blocking and fire-and-forget modes
//! - **sink**: `log(record)` facade over the batching engine
//! - **bridge**: Forwards stdout/stderr lines into a sink
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use logsink::config::Config;
//! use logsink::exporter::OtlpExporter;
//! use logsink::record::Severity;
//! use logsink::sink::LogSink;
//! use logsink::supervisor::ConsumerSupervisor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Ship a file, resuming from its checkpoint
//!     let exporter = Arc::new(OtlpExporter::new(&config).expect("Failed to create exporter"));
//!     let supervisor = ConsumerSupervisor::new(config.clone(), exporter)
//!         .await
//!         .expect("Failed to start supervisor");
//!     supervisor.enqueue("/var/log/app.log").await.expect("Failed to enqueue");
//!     supervisor.wait_idle().await;
//!
//!     // Or push records directly
//!     let sink = LogSink::new(&config).expect("Failed to create sink");
//!     sink.log_message(0, "hello", Severity::Info, &[("component", "demo")]);
//!     sink.shutdown().await;
//! }
//! ```

pub mod assembler;
pub mod bridge;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod envelope;
pub mod exporter;
pub mod record;
pub mod sink;
pub mod supervisor;
pub mod tailer;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use buffer::{BatchingEngine, BufferError, EngineSettings, EngineStats};
pub use checkpoint::CheckpointStore;
pub use config::{Config, ConfigBuilder, ConfigError};
pub use exporter::{ExportError, ExportStats, LogExporter, OtlpExporter};
pub use record::{Attributes, Batch, LogRecord, ResourceContext, Severity};
pub use sink::{LogSink, SinkError};
pub use supervisor::{ConsumerSupervisor, SupervisorError};
pub use tailer::{FileTailer, TailError, TailOutcome};
