//! File tailing with crash-safe checkpoints.
//!
//! A [`FileTailer`] owns one file. It resumes from the last checkpointed
//! offset, assembles multi-line records, and exports them in file order. The
//! checkpoint only moves forward after the exporter confirms a batch; a failed
//! export keeps the records in memory and re-sends them after a backoff.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::{AssembledRecord, RecordAssembler};
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::exporter::LogExporter;
use crate::record::{now_unix_nanos, Batch, LogRecord, ResourceContext};

/// Default base delay for exponential backoff.
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Maximum delay between export retries.
const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TailError {
    /// The file does not exist (any more)
    #[error("Log file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How a tailer task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailOutcome {
    /// Every byte up to end-of-file was exported and checkpointed
    Completed,

    /// Stopped by cancellation; state on disk allows resuming later
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TailSettings {
    pub max_batch_size: usize,
    pub publish_interval: Duration,
    pub follow: bool,
    pub poll_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl TailSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_batch_size: config.max_batch_size(),
            publish_interval: config.publish_interval(),
            follow: config.follow(),
            poll_interval: config.poll_interval(),
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
        }
    }
}

/// A record waiting for export plus the file offset right after it.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub record: LogRecord,
    pub end_offset: u64,
}

pub struct FileTailer {
    path: PathBuf,
    store: Arc<CheckpointStore>,
    exporter: Arc<dyn LogExporter>,
    resource: ResourceContext,
    assembler: RecordAssembler,
    settings: TailSettings,
    cancel: CancellationToken,

    pending: Vec<PendingRecord>,
    first_buffered: Option<Instant>,
    committed: u64,
    records_exported: u64,
}

impl FileTailer {
    pub fn new(
        path: impl Into<PathBuf>,
        config: &Config,
        store: Arc<CheckpointStore>,
        exporter: Arc<dyn LogExporter>,
        cancel: CancellationToken,
    ) -> Self {
        let path = path.into();
        let resource = config.resource_for_file(&path);
        Self {
            assembler: RecordAssembler::new(config.record_start_pattern().clone()),
            settings: TailSettings::from_config(config),
            path,
            store,
            exporter,
            resource,
            cancel,
            pending: Vec::new(),
            first_buffered: None,
            committed: 0,
            records_exported: 0,
        }
    }

    /// Replace the settings derived from the configuration.
    pub fn with_settings(mut self, settings: TailSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tail the file until it is fully exported (or, in follow mode, until it
    /// disappears) or the task is cancelled.
    pub async fn run(mut self) -> Result<TailOutcome, TailError> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TailError::FileNotFound(self.path.clone()))
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let len = file.metadata().await.map_err(|e| self.io_error(e))?.len();
        let path = self.path.clone();
        let mut offset = self
            .store
            .blocking(move |store| Ok(store.load(&path)))
            .await
            .map_err(|e| self.io_error(e))?;
        if offset > len {
            warn!(
                path = %self.path.display(),
                checkpoint = offset,
                len,
                "Checkpoint is past end of file, file was replaced; starting over"
            );
            let path = self.path.clone();
            if let Err(e) = self
                .store
                .blocking(move |store| store.forget_checkpoint(&path))
                .await
            {
                warn!(path = %self.path.display(), error = %e, "Failed to reset checkpoint");
            }
            offset = 0;
        }
        self.committed = offset;

        let mut reader = BufReader::new(file);
        reader
            .seek(io::SeekFrom::Start(offset))
            .await
            .map_err(|e| self.io_error(e))?;

        info!(path = %self.path.display(), offset, follow = self.settings.follow, "Tailing file");

        let mut position = offset;
        let mut line = Vec::with_capacity(256);
        let mut last_data = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.stop_cancelled().await);
            }

            let n = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| self.io_error(e))?;
            position += n as u64;
            if n > 0 {
                last_data = Instant::now();
            }

            let unterminated = !line.ends_with(b"\n");
            if n == 0 || (unterminated && self.settings.follow) {
                if !self.settings.follow {
                    return self.finish_at_eof().await;
                }

                // Follow mode: wait for growth, holding any partial line.
                if self.flush_due() && !self.flush_with_retry().await {
                    return Ok(self.stop_cancelled().await);
                }
                if line.is_empty()
                    && self.assembler.has_partial()
                    && last_data.elapsed() >= self.settings.publish_interval
                {
                    if let Some(record) = self.assembler.finish() {
                        self.buffer(record);
                    }
                    if !self.flush_with_retry().await {
                        return Ok(self.stop_cancelled().await);
                    }
                }

                match tokio::fs::metadata(&self.path).await {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        info!(path = %self.path.display(), "File removed, finishing");
                        if !line.is_empty() {
                            self.accept_line(&line, position);
                            line.clear();
                        }
                        return self.finish_at_eof().await;
                    }
                    Err(e) => return Err(self.io_error(e)),
                    Ok(_) => {}
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(self.stop_cancelled().await),
                    _ = sleep(self.settings.poll_interval) => {}
                }
                continue;
            }

            self.accept_line(&line, position);
            line.clear();

            if self.flush_due() && !self.flush_with_retry().await {
                return Ok(self.stop_cancelled().await);
            }
        }
    }

    fn accept_line(&mut self, raw: &[u8], end_offset: u64) {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);
        if let Some(record) = self.assembler.push_line(&text, end_offset) {
            self.buffer(record);
        }
    }

    fn buffer(&mut self, assembled: AssembledRecord) {
        let end_offset = assembled.end_offset;
        self.pending.push(PendingRecord {
            record: assembled.into_log_record(now_unix_nanos()),
            end_offset,
        });
        self.first_buffered.get_or_insert_with(Instant::now);
    }

    fn flush_due(&self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.pending.len() >= self.settings.max_batch_size
            || self
                .first_buffered
                .is_some_and(|t| t.elapsed() >= self.settings.publish_interval)
    }

    async fn finish_at_eof(&mut self) -> Result<TailOutcome, TailError> {
        if let Some(record) = self.assembler.finish() {
            self.buffer(record);
        }
        while !self.pending.is_empty() {
            if !self.flush_with_retry().await {
                return Ok(self.stop_cancelled().await);
            }
        }
        info!(
            path = %self.path.display(),
            records = self.records_exported,
            offset = self.committed,
            "Reached end of file"
        );
        Ok(TailOutcome::Completed)
    }

    /// Export the oldest pending batch, retrying with backoff until the
    /// exporter confirms. Returns `false` if cancelled while waiting to retry;
    /// the batch then stays pending for [`Self::stop_cancelled`].
    async fn flush_with_retry(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }

        let take = self.pending.len().min(self.settings.max_batch_size);
        let batch = Batch::new(self.pending[..take].iter().map(|p| p.record.clone()).collect());
        let max_offset = self.pending[..take]
            .iter()
            .map(|p| p.end_offset)
            .max()
            .unwrap_or(self.committed);

        let mut attempt: u32 = 0;
        loop {
            match self.exporter.export(&batch, &self.resource).await {
                Ok(()) => {
                    self.commit(take, max_offset).await;
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    let delay =
                        backoff_delay(attempt, self.settings.retry_base, self.settings.retry_max);
                    warn!(
                        path = %self.path.display(),
                        batch_id = %batch.batch_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch export failed; will retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn commit(&mut self, exported: usize, offset: u64) {
        self.pending.drain(..exported);
        self.records_exported += exported as u64;
        self.first_buffered = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };

        if offset <= self.committed {
            return;
        }
        let path = self.path.clone();
        match self.store.blocking(move |store| store.save(&path, offset)).await {
            Ok(()) => {
                debug!(path = %self.path.display(), offset, "Checkpoint advanced");
                self.committed = offset;
            }
            Err(e) => {
                // The records are already exported; a restart re-sends them.
                warn!(path = %self.path.display(), offset, error = %e, "Failed to save checkpoint");
            }
        }
    }

    /// One last export attempt of fully assembled records, without reading
    /// any further. The open partial record is left for the next run.
    async fn stop_cancelled(&mut self) -> TailOutcome {
        if !self.pending.is_empty() {
            let batch = Batch::new(self.pending.iter().map(|p| p.record.clone()).collect());
            let max_offset = self.pending.iter().map(|p| p.end_offset).max().unwrap_or(0);
            match self.exporter.export(&batch, &self.resource).await {
                Ok(()) => self.commit(self.pending.len(), max_offset).await,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Final export on shutdown failed")
                }
            }
        }
        info!(path = %self.path.display(), offset = self.committed, "Tailer cancelled");
        TailOutcome::Cancelled
    }

    fn io_error(&self, source: io::Error) -> TailError {
        TailError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Exponential backoff with up to 25% jitter, capped at `max`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exponential = base_ms.saturating_mul(1 << attempt.saturating_sub(1).min(10));
    let jitter = rand::random::<u64>() % (exponential / 4 + 1);
    Duration::from_millis(exponential.saturating_add(jitter)).min(max)
}
