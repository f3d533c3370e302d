//! End-to-end tests: files on disk through the supervisor to an exporter.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mockito::{Matcher, Server};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use logsink::{
    Batch, Config, ConfigBuilder, ConsumerSupervisor, ExportError, LogExporter, OtlpExporter,
    ResourceContext,
};

const FIRST: &str = "2024-01-01 00:00:01 INFO first\ncontinued\n";
const SECOND: &str = "2024-01-01 00:00:02 ERROR second\n";
const THIRD: &str = "2024-01-01 00:00:03 INFO third\n";

fn config(dir: &Path, endpoint: &str, customize: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Config {
    let builder = Config::builder()
        .otlp_endpoint(endpoint)
        .api_key("test-key")
        .checkpoint_dir(dir.join("checkpoints"))
        .request_timeout(Duration::from_secs(5));
    customize(builder).build().unwrap()
}

/// Accepts the first `succeed` batches, then fails every call.
struct FlakyExporter {
    succeed: usize,
    calls: AtomicUsize,
    bodies: Mutex<Vec<String>>,
}

impl FlakyExporter {
    fn new(succeed: usize) -> Self {
        Self {
            succeed,
            calls: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogExporter for FlakyExporter {
    async fn export(&self, batch: &Batch, _resource: &ResourceContext) -> Result<(), ExportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.succeed {
            return Err(ExportError::Client("backend unavailable".to_string()));
        }
        self.bodies
            .lock()
            .unwrap()
            .extend(batch.records.iter().map(|r| r.body().to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn test_file_is_shipped_over_http_and_cleaned_up() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.log");
    std::fs::write(&path, format!("{}{}", FIRST, SECOND)).unwrap();

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs")
        .match_header("x-cardinalhq-api-key", "test-key")
        .match_header("content-type", "application/x-protobuf")
        .match_header("content-encoding", "gzip")
        .match_body(Matcher::Any)
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let config = config(dir.path(), &format!("{}/v1/logs", server.url()), |b| b.max_batch_size(1));
    let exporter = Arc::new(OtlpExporter::new(&config).unwrap());
    let supervisor = ConsumerSupervisor::new(config, exporter.clone()).await.unwrap();

    assert!(supervisor.enqueue(&path).await.unwrap());
    timeout(Duration::from_secs(10), supervisor.wait_idle()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(exporter.stats().records_sent, 2);

    let store = supervisor.checkpoint_store();
    assert!(store.tracked_files().is_empty());
    assert!(!store.checkpoint_path(&path).exists());
}

#[tokio::test]
async fn test_unavailable_backend_then_restart_delivers_everything() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.log");
    std::fs::write(&path, format!("{}{}", FIRST, SECOND)).unwrap();

    // First run: the backend rejects everything, so nothing may be checkpointed.
    {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/logs")
            .with_status(503)
            .expect_at_least(1)
            .create_async()
            .await;

        let config = config(dir.path(), &format!("{}/v1/logs", server.url()), |b| b);
        let exporter = Arc::new(OtlpExporter::new(&config).unwrap());
        let supervisor = ConsumerSupervisor::new(config, exporter.clone()).await.unwrap();
        supervisor.enqueue(&path).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while exporter.stats().batches_failed == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        timeout(Duration::from_secs(5), supervisor.shutdown()).await.unwrap();

        let store = supervisor.checkpoint_store();
        assert_eq!(store.tracked_files().len(), 1);
        assert_eq!(store.load(&store.tracked_files()[0]), 0);
    }

    // Second run: the tracked file is resumed without being enqueued again.
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = config(dir.path(), &format!("{}/v1/logs", server.url()), |b| b);
    let exporter = Arc::new(OtlpExporter::new(&config).unwrap());
    let supervisor = ConsumerSupervisor::new(config, exporter.clone()).await.unwrap();
    timeout(Duration::from_secs(10), supervisor.wait_idle()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(exporter.stats().records_sent, 2);
    assert!(supervisor.checkpoint_store().tracked_files().is_empty());
}

#[tokio::test]
async fn test_crash_resume_only_resends_unconfirmed_records() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("app.log");
    std::fs::write(&path, format!("{}{}{}", FIRST, SECOND, THIRD)).unwrap();
    let endpoint = "http://127.0.0.1:9/v1/logs";

    // First run confirms one batch, then the backend goes away.
    let flaky = Arc::new(FlakyExporter::new(1));
    {
        let config = config(dir.path(), endpoint, |b| b.max_batch_size(1));
        let supervisor = ConsumerSupervisor::new(config, flaky.clone()).await.unwrap();
        supervisor.enqueue(&path).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while flaky.calls() < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        timeout(Duration::from_secs(5), supervisor.shutdown()).await.unwrap();

        let store = supervisor.checkpoint_store();
        let tracked = store.tracked_files();
        assert_eq!(tracked.len(), 1);
        assert_eq!(store.load(&tracked[0]), FIRST.len() as u64);
    }
    assert_eq!(flaky.bodies(), vec![FIRST.to_string()]);

    // Restart with a healthy backend.
    let healthy = Arc::new(FlakyExporter::new(usize::MAX));
    let config = config(dir.path(), endpoint, |b| b.max_batch_size(1));
    let supervisor = ConsumerSupervisor::new(config, healthy.clone()).await.unwrap();
    timeout(Duration::from_secs(10), supervisor.wait_idle()).await.unwrap();

    assert_eq!(healthy.bodies(), vec![SECOND.to_string(), THIRD.to_string()]);
    assert!(supervisor.checkpoint_store().tracked_files().is_empty());
}
