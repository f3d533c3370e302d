//! logsink - ship log files to an OTLP/HTTP backend
//!
//! Each file given on the command line is read from its last checkpoint,
//! grouped into multi-line records, and exported in batches. Files that a
//! previous run did not finish are resumed automatically.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables and then overridden by
//! command-line flags:
//!
//! - `LOGSINK_OTLP_ENDPOINT` / `OTEL_EXPORTER_OTLP_ENDPOINT`: export URL (required)
//! - `LOGSINK_API_KEY`: API key sent with every request
//! - `LOGSINK_MAX_BATCH_SIZE`: records per export (default: 100)
//! - `LOGSINK_PUBLISH_INTERVAL_MS`: max time records wait before export (default: 5000)
//! - `LOGSINK_CHECKPOINT_DIR`: checkpoint directory (default: ./checkpoints)
//! - `LOGSINK_FOLLOW`: keep tailing files after end-of-file (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use logsink::config::Config;
use logsink::exporter::OtlpExporter;
use logsink::supervisor::ConsumerSupervisor;

/// How long shutdown waits for tailers to stop after Ctrl-C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "logsink", version, about = "Ship log files to an OTLP/HTTP backend")]
struct Cli {
    /// Keep tailing files for new data instead of stopping at end-of-file
    #[arg(long)]
    follow: bool,

    /// Directory for checkpoints and the in-progress file list
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// OTLP/HTTP logs endpoint
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,

    /// Value of the service.name resource attribute
    #[arg(long, value_name = "NAME")]
    service_name: Option<String>,

    /// Log files to ship
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => {
            info!(
                endpoint = %config.otlp_endpoint(),
                max_batch_size = config.max_batch_size(),
                checkpoint_dir = %config.checkpoint_dir().display(),
                follow = config.follow(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let exporter = match OtlpExporter::new(&config) {
        Ok(exporter) => Arc::new(exporter),
        Err(e) => {
            error!(error = %e, "Failed to create exporter");
            return ExitCode::FAILURE;
        }
    };

    let supervisor = match ConsumerSupervisor::new(config, exporter.clone()).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "Failed to start supervisor");
            return ExitCode::FAILURE;
        }
    };

    let mut failed = false;
    for file in &cli.files {
        match supervisor.enqueue(file).await {
            Ok(true) => {}
            Ok(false) => info!(path = %file.display(), "File already being shipped"),
            Err(e) => {
                error!(path = %file.display(), error = %e, "Cannot ship file");
                failed = true;
            }
        }
    }

    tokio::select! {
        _ = supervisor.wait_idle() => {
            info!("All files shipped");
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, supervisor.shutdown()).await.is_err() {
                warn!("Tailer shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
            }
        }
    }

    let stats = exporter.stats();
    info!(
        batches_sent = stats.batches_sent,
        records_sent = stats.records_sent,
        batches_failed = stats.batches_failed,
        "logsink stopped"
    );

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn load_config(cli: &Cli) -> Result<Config, logsink::ConfigError> {
    let mut builder = Config::builder_from_env()?;
    if cli.follow {
        builder = builder.follow(true);
    }
    if let Some(dir) = &cli.checkpoint_dir {
        builder = builder.checkpoint_dir(dir);
    }
    if let Some(endpoint) = &cli.endpoint {
        builder = builder.otlp_endpoint(endpoint);
    }
    if let Some(name) = &cli.service_name {
        builder = builder.service_name(name);
    }
    builder.build()
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_flags_and_files() {
        let cli = Cli::parse_from([
            "logsink",
            "--follow",
            "--checkpoint-dir",
            "/tmp/cp",
            "--endpoint",
            "http://collector:4318/v1/logs",
            "a.log",
            "b.log",
        ]);
        assert!(cli.follow);
        assert_eq!(cli.checkpoint_dir, Some(PathBuf::from("/tmp/cp")));
        assert_eq!(cli.endpoint.as_deref(), Some("http://collector:4318/v1/logs"));
        assert_eq!(cli.files, vec![PathBuf::from("a.log"), PathBuf::from("b.log")]);
    }
}
