//! Supervisor that owns one tailer task per file.
//!
//! The supervisor keeps the tracked-file list in the checkpoint store in sync
//! with the running tasks, so that after a restart every file that was still
//! being shipped is picked up again from its checkpoint.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::exporter::LogExporter;
use crate::tailer::{FileTailer, TailError, TailOutcome};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Log file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct ConsumerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    store: Arc<CheckpointStore>,
    exporter: Arc<dyn LogExporter>,
    cancel: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
    running: Mutex<HashSet<PathBuf>>,

    /// Number of running tailers, published for `wait_idle`.
    active: watch::Sender<usize>,
}

impl ConsumerSupervisor {
    /// Open the checkpoint store and resume every file tracked by a previous
    /// run. Tracked files that no longer exist are forgotten.
    pub async fn new(config: Config, exporter: Arc<dyn LogExporter>) -> Result<Self, SupervisorError> {
        let dir = config.checkpoint_dir().to_path_buf();
        let store = tokio::task::spawn_blocking(move || CheckpointStore::open(dir))
            .await
            .map_err(io::Error::other)??;
        let store = Arc::new(store);
        let limiter = config
            .max_concurrent_tailers()
            .map(|n| Arc::new(Semaphore::new(n)));
        let (active, _) = watch::channel(0);

        let supervisor = Self {
            inner: Arc::new(Inner {
                config,
                store,
                exporter,
                cancel: CancellationToken::new(),
                limiter,
                running: Mutex::new(HashSet::new()),
                active,
            }),
        };

        let tracked = supervisor
            .inner
            .store
            .blocking(|store| Ok(store.tracked_files()))
            .await?;
        for path in tracked {
            match supervisor.enqueue(&path).await {
                Ok(_) => info!(path = %path.display(), "Resuming tracked file"),
                Err(SupervisorError::FileNotFound(_)) => {
                    warn!(path = %path.display(), "Tracked file is gone, forgetting it");
                    let missing = path.clone();
                    if let Err(e) = supervisor
                        .inner
                        .store
                        .blocking(move |store| store.forget(&missing))
                        .await
                    {
                        warn!(path = %path.display(), error = %e, "Failed to forget tracked file");
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(supervisor)
    }

    /// Start shipping `path`.
    ///
    /// Returns `Ok(false)` if the file is already being tailed.
    pub async fn enqueue(&self, path: impl AsRef<Path>) -> Result<bool, SupervisorError> {
        let path = normalize_path(path.as_ref())?;
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(SupervisorError::FileNotFound(path));
        }

        {
            let mut running = self.inner.lock_running();
            if !running.insert(path.clone()) {
                return Ok(false);
            }
            self.inner.active.send_replace(running.len());
        }

        let tracked = path.clone();
        if let Err(e) = self
            .inner
            .store
            .blocking(move |store| store.track(&tracked))
            .await
        {
            self.inner.finish(&path);
            return Err(e.into());
        }

        info!(path = %path.display(), "Enqueued file");
        tokio::spawn(run_tailer(self.inner.clone(), path));
        Ok(true)
    }

    /// Files with a live tailer, sorted.
    pub fn active_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = self.inner.lock_running().iter().cloned().collect();
        files.sort();
        files
    }

    /// Resolves once no tailer is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    /// Cancel every tailer and wait for all of them to stop.
    pub async fn shutdown(&self) {
        info!(active = self.active_files().len(), "Shutting down tailers");
        self.inner.cancel.cancel();
        self.wait_idle().await;
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.inner.store
    }
}

impl Inner {
    fn lock_running(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, path: &Path) {
        let mut running = self.lock_running();
        running.remove(path);
        self.active.send_replace(running.len());
    }

    /// Forget a file whose tailer is done and drop it from the running set
    /// under the same lock, so `enqueue` never sees it running but untracked.
    async fn retire(self: &Arc<Self>, path: &Path) -> io::Result<()> {
        let inner = Arc::clone(self);
        let retired = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            let mut running = inner.lock_running();
            let result = inner.store.forget(&retired);
            running.remove(&retired);
            inner.active.send_replace(running.len());
            result
        })
        .await;
        match result {
            Ok(result) => result,
            Err(e) => {
                self.finish(path);
                Err(io::Error::other(e))
            }
        }
    }
}

async fn run_tailer(inner: Arc<Inner>, path: PathBuf) {
    let _permit = match &inner.limiter {
        Some(limiter) => tokio::select! {
            _ = inner.cancel.cancelled() => {
                inner.finish(&path);
                return;
            }
            permit = limiter.clone().acquire_owned() => permit.ok(),
        },
        None => None,
    };

    let tailer = FileTailer::new(
        &path,
        &inner.config,
        inner.store.clone(),
        inner.exporter.clone(),
        inner.cancel.child_token(),
    );

    match tailer.run().await {
        Ok(TailOutcome::Completed) => {
            if let Err(e) = inner.retire(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to clean up finished file");
            }
        }
        Ok(TailOutcome::Cancelled) => {
            info!(path = %path.display(), "Tailer stopped; file stays tracked");
            inner.finish(&path);
        }
        Err(TailError::FileNotFound(_)) => {
            warn!(path = %path.display(), "File disappeared before it could be read");
            if let Err(e) = inner.retire(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to forget missing file");
            }
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Tailer failed; file stays tracked");
            inner.finish(&path);
        }
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically.
pub fn normalize_path(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
