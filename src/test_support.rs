//! Shared doubles for unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::checkpoint::CheckpointStore;
use crate::config::{Config, ConfigBuilder};
use crate::exporter::{ExportError, LogExporter};
use crate::record::{Batch, ResourceContext};

/// Config pointing at an unused endpoint with checkpoints under `dir`.
pub fn test_config(dir: &Path, customize: impl FnOnce(ConfigBuilder) -> ConfigBuilder) -> Config {
    let builder = Config::builder()
        .otlp_endpoint("http://127.0.0.1:9/v1/logs")
        .checkpoint_dir(dir.join("checkpoints"));
    customize(builder).build().unwrap()
}

/// Records every batch it accepts; can be told to fail the first N calls.
#[derive(Default)]
pub struct RecordingExporter {
    batches: Mutex<Vec<Batch>>,
    resources: Mutex<Vec<ResourceContext>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    observe: Option<(Arc<CheckpointStore>, PathBuf)>,
    observed: Mutex<Vec<u64>>,
}

impl RecordingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    /// Captures the checkpoint of `path` at the moment of every export call.
    pub fn observing_checkpoints(store: Arc<CheckpointStore>, path: PathBuf) -> Self {
        Self {
            observe: Some((store, path)),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Batch::len).collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.records.iter().map(|r| r.body().to_string()))
            .collect()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn last_resource(&self) -> Option<ResourceContext> {
        self.resources.lock().unwrap().last().cloned()
    }

    pub fn observed_checkpoints(&self) -> Vec<u64> {
        self.observed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogExporter for RecordingExporter {
    async fn export(&self, batch: &Batch, resource: &ResourceContext) -> Result<(), ExportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some((store, path)) = &self.observe {
            self.observed.lock().unwrap().push(store.load(path));
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExportError::Client("injected failure".to_string()));
        }

        self.batches.lock().unwrap().push(batch.clone());
        self.resources.lock().unwrap().push(resource.clone());
        Ok(())
    }
}
