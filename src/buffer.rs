//! Batching engine for programmatically produced records.
//!
//! Producers push records into a bounded tokio mpsc channel without ever
//! blocking. A single consumer task drains the channel and hands batches to
//! the exporter when:
//! - The batch size threshold is reached (size-based flush)
//! - A flush signal is processed, either explicit or from the ticker
//! - The engine shuts down
//!
//! Flush and shutdown travel through the same channel as records, so a flush
//! only covers records enqueued before it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exporter::LogExporter;
use crate::record::{Batch, LogRecord, ResourceContext};

/// Smallest channel capacity the engine will use.
const MIN_CHANNEL_CAPACITY: usize = 1024;

/// A dropped-record warning is logged on the first drop and every Nth after.
const DROP_WARN_EVERY: u64 = 1000;

/// Settings for the batching engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Number of records to accumulate before triggering a flush
    pub max_batch_size: usize,

    /// Requested queue size; see [`EngineSettings::channel_capacity`]
    pub queue_size: usize,

    /// Period of the background flush ticker
    pub flush_interval: Duration,
}

impl EngineSettings {
    pub fn new(max_batch_size: usize, queue_size: usize, flush_interval: Duration) -> Self {
        Self {
            max_batch_size,
            queue_size,
            flush_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_batch_size(), config.queue_size(), config.flush_interval())
    }

    /// Queue size rounded up to a power of two, never below 1024.
    pub fn channel_capacity(&self) -> usize {
        self.queue_size.next_power_of_two().max(MIN_CHANNEL_CAPACITY)
    }
}

/// Statistics about engine operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Total number of records accepted into the queue
    pub records_accepted: u64,

    /// Total number of records rejected (queue full or engine shut down)
    pub records_dropped: u64,

    pub batches_exported: u64,
    pub records_exported: u64,
    pub batches_failed: u64,

    /// Number of flushes triggered by the batch size threshold
    pub size_flushes: u64,

    /// Number of flushes triggered by a flush signal
    pub signal_flushes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    records_accepted: AtomicU64,
    records_dropped: AtomicU64,
    batches_exported: AtomicU64,
    records_exported: AtomicU64,
    batches_failed: AtomicU64,
    size_flushes: AtomicU64,
    signal_flushes: AtomicU64,
}

/// Errors returned by [`BatchingEngine::try_add`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The queue is full (for non-blocking adds)
    #[error("Buffer queue is full")]
    Full,

    /// The engine has been shut down and is no longer accepting records
    #[error("Buffer has been shut down")]
    Closed,
}

enum Signal {
    Record(LogRecord),
    Flush,
    Shutdown,
}

pub struct BatchingEngine {
    tx: mpsc::Sender<Signal>,
    accepting: AtomicBool,
    counters: Arc<Counters>,
    ticker_cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingEngine {
    /// Spawn the consumer and ticker tasks. Must be called inside a tokio
    /// runtime.
    pub fn start(
        settings: EngineSettings,
        exporter: Arc<dyn LogExporter>,
        resource: ResourceContext,
    ) -> Self {
        let capacity = settings.channel_capacity();
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());
        let ticker_cancel = CancellationToken::new();

        let consumer = tokio::spawn(consume(
            rx,
            exporter,
            resource,
            settings.max_batch_size,
            counters.clone(),
        ));
        let ticker = tokio::spawn(tick(tx.clone(), settings.flush_interval, ticker_cancel.clone()));

        info!(
            capacity,
            max_batch_size = settings.max_batch_size,
            flush_interval_ms = settings.flush_interval.as_millis() as u64,
            "Batching engine started"
        );

        Self {
            tx,
            accepting: AtomicBool::new(true),
            counters,
            ticker_cancel,
            consumer: Mutex::new(Some(consumer)),
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// Enqueue a record without waiting. Returns `false` if it was dropped.
    ///
    /// `None` is accepted and ignored.
    pub fn add(&self, record: impl Into<Option<LogRecord>>) -> bool {
        match record.into() {
            Some(record) => self.try_add(record).is_ok(),
            None => true,
        }
    }

    /// Enqueue a record without waiting, reporting why it was rejected.
    pub fn try_add(&self, record: LogRecord) -> Result<(), BufferError> {
        if !self.accepting.load(Ordering::Acquire) {
            self.record_drop(BufferError::Closed);
            return Err(BufferError::Closed);
        }

        let result = self.tx.try_send(Signal::Record(record)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BufferError::Full,
            mpsc::error::TrySendError::Closed(_) => BufferError::Closed,
        });
        match result {
            Ok(()) => {
                self.counters.records_accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.record_drop(e);
                Err(e)
            }
        }
    }

    /// Enqueue a record, waiting up to `timeout` for queue space.
    pub async fn add_timeout(&self, record: LogRecord, timeout: Duration) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            self.record_drop(BufferError::Closed);
            return false;
        }

        match self.tx.send_timeout(Signal::Record(record), timeout).await {
            Ok(()) => {
                self.counters.records_accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.record_drop(BufferError::Full);
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.record_drop(BufferError::Closed);
                false
            }
        }
    }

    /// Ask the consumer to export everything enqueued so far.
    pub async fn flush(&self) {
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }
        if self.tx.send(Signal::Flush).await.is_err() {
            debug!("Flush requested after consumer exited");
        }
    }

    /// Stop accepting records, drain the queue and wait for the consumer.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        self.ticker_cancel.cancel();
        if let Some(ticker) = take_handle(&self.ticker) {
            let _ = ticker.await;
        }

        if self.tx.send(Signal::Shutdown).await.is_err() {
            warn!("Consumer exited before shutdown signal");
        }
        if let Some(consumer) = take_handle(&self.consumer) {
            if let Err(e) = consumer.await {
                warn!(error = %e, "Batching consumer task failed");
            }
        }

        let stats = self.stats();
        info!(
            records_accepted = stats.records_accepted,
            records_dropped = stats.records_dropped,
            batches_exported = stats.batches_exported,
            batches_failed = stats.batches_failed,
            "Batching engine stopped"
        );
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            records_accepted: c.records_accepted.load(Ordering::Relaxed),
            records_dropped: c.records_dropped.load(Ordering::Relaxed),
            batches_exported: c.batches_exported.load(Ordering::Relaxed),
            records_exported: c.records_exported.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            size_flushes: c.size_flushes.load(Ordering::Relaxed),
            signal_flushes: c.signal_flushes.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self, reason: BufferError) {
        let dropped = self.counters.records_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % DROP_WARN_EVERY == 0 {
            warn!(dropped, reason = %reason, "Dropping log record");
        }
    }
}

impl Drop for BatchingEngine {
    fn drop(&mut self) {
        // Without the ticker's sender the consumer sees the channel close,
        // exports what it holds and exits.
        self.ticker_cancel.cancel();
    }
}

fn take_handle(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
}

async fn tick(tx: mpsc::Sender<Signal>, flush_interval: Duration, cancel: CancellationToken) {
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // A full queue will flush on size anyway; try again next tick.
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(Signal::Flush) {
                    break;
                }
            }
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Signal>,
    exporter: Arc<dyn LogExporter>,
    resource: ResourceContext,
    max_batch_size: usize,
    counters: Arc<Counters>,
) {
    let mut pending: Vec<LogRecord> = Vec::with_capacity(max_batch_size);

    while let Some(signal) = rx.recv().await {
        match signal {
            Signal::Record(record) => {
                pending.push(record);
                if pending.len() >= max_batch_size {
                    counters.size_flushes.fetch_add(1, Ordering::Relaxed);
                    debug!(batch_size = pending.len(), "Size-based flush triggered");
                    export(&mut pending, max_batch_size, &*exporter, &resource, &counters).await;
                }
            }
            Signal::Flush => {
                if !pending.is_empty() {
                    counters.signal_flushes.fetch_add(1, Ordering::Relaxed);
                    debug!(batch_size = pending.len(), "Signal flush triggered");
                    export(&mut pending, max_batch_size, &*exporter, &resource, &counters).await;
                }
            }
            Signal::Shutdown => {
                rx.close();
                // Records that raced in before the close are still delivered.
                while let Some(signal) = rx.recv().await {
                    if let Signal::Record(record) = signal {
                        pending.push(record);
                        if pending.len() >= max_batch_size {
                            export(&mut pending, max_batch_size, &*exporter, &resource, &counters)
                                .await;
                        }
                    }
                }
                break;
            }
        }
    }

    if !pending.is_empty() {
        info!(remaining = pending.len(), "Flushing remaining records");
        export(&mut pending, max_batch_size, &*exporter, &resource, &counters).await;
    }
}

async fn export(
    pending: &mut Vec<LogRecord>,
    max_batch_size: usize,
    exporter: &dyn LogExporter,
    resource: &ResourceContext,
    counters: &Counters,
) {
    let records = std::mem::replace(pending, Vec::with_capacity(max_batch_size));
    let batch = Batch::new(records);

    match exporter.export(&batch, resource).await {
        Ok(()) => {
            counters.batches_exported.fetch_add(1, Ordering::Relaxed);
            counters
                .records_exported
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!(batch_id = %batch.batch_id, records = batch.len(), error = %e, "Discarding batch after failed export");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::ExportError;
    use crate::record::Attributes;
    use crate::test_support::RecordingExporter;
    use async_trait::async_trait;
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout, Instant};

    fn record(i: usize) -> LogRecord {
        LogRecord::new(format!("record {}", i))
    }

    fn resource() -> ResourceContext {
        ResourceContext::for_service("test", &Attributes::new())
    }

    async fn wait_for_batches(exporter: &RecordingExporter, n: usize) {
        timeout(Duration::from_secs(5), async {
            while exporter.batch_sizes().len() < n {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("batches should arrive");
    }

    /// Holds every export until the gate is opened.
    struct GatedExporter {
        gate: Semaphore,
    }

    #[async_trait]
    impl LogExporter for GatedExporter {
        async fn export(&self, _batch: &Batch, _resource: &ResourceContext) -> Result<(), ExportError> {
            let _permit = self.gate.acquire().await;
            Ok(())
        }
    }

    #[test]
    fn test_channel_capacity_rounding() {
        let settings = |q| EngineSettings::new(10, q, Duration::from_secs(1));
        assert_eq!(settings(1).channel_capacity(), 1024);
        assert_eq!(settings(1000).channel_capacity(), 1024);
        assert_eq!(settings(1025).channel_capacity(), 2048);
        assert_eq!(settings(4096).channel_capacity(), 4096);
    }

    #[test]
    fn test_buffer_error_display() {
        assert_eq!(BufferError::Full.to_string(), "Buffer queue is full");
        assert_eq!(BufferError::Closed.to_string(), "Buffer has been shut down");
    }

    #[tokio::test]
    async fn test_saturated_engine_rejects_without_blocking() {
        let exporter = Arc::new(GatedExporter {
            gate: Semaphore::new(0),
        });
        let engine = BatchingEngine::start(
            EngineSettings::new(1, 1, Duration::from_secs(60)),
            exporter.clone(),
            resource(),
        );

        let started = Instant::now();
        let mut rejected = None;
        for i in 0..4096 {
            if !engine.add(record(i)) {
                rejected = Some(i);
                break;
            }
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let rejected = rejected.expect("a saturated queue must reject");
        assert!(rejected >= 1024);
        assert_eq!(engine.stats().records_dropped, 1);

        exporter.gate.add_permits(1);
        engine.shutdown().await;
        assert_eq!(engine.stats().batches_exported, rejected as u64);
    }

    #[tokio::test]
    async fn test_burst_of_twice_batch_size_splits() {
        let exporter = Arc::new(RecordingExporter::new());
        let engine = BatchingEngine::start(
            EngineSettings::new(10, 100, Duration::from_secs(60)),
            exporter.clone(),
            resource(),
        );

        for i in 0..20 {
            assert!(engine.add(record(i)));
        }
        wait_for_batches(&exporter, 2).await;

        assert_eq!(exporter.batch_sizes(), vec![10, 10]);
        assert_eq!(exporter.bodies()[0], "record 0");
        assert_eq!(exporter.bodies()[19], "record 19");
        assert_eq!(engine.stats().size_flushes, 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_record_flushed_within_one_tick() {
        let exporter = Arc::new(RecordingExporter::new());
        let engine = BatchingEngine::start(
            EngineSettings::new(100, 100, Duration::from_millis(50)),
            exporter.clone(),
            resource(),
        );

        assert!(engine.add(record(0)));
        wait_for_batches(&exporter, 1).await;

        assert_eq!(exporter.batch_sizes(), vec![1]);
        assert_eq!(engine.stats().signal_flushes, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_covers_only_earlier_records() {
        let exporter = Arc::new(RecordingExporter::new());
        let engine = BatchingEngine::start(
            EngineSettings::new(100, 100, Duration::from_secs(60)),
            exporter.clone(),
            resource(),
        );

        for i in 0..3 {
            engine.add(record(i));
        }
        engine.flush().await;
        for i in 3..5 {
            engine.add(record(i));
        }
        wait_for_batches(&exporter, 1).await;
        engine.shutdown().await;

        assert_eq!(exporter.batch_sizes(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_new_records() {
        let exporter = Arc::new(RecordingExporter::new());
        let engine = BatchingEngine::start(
            EngineSettings::new(100, 100, Duration::from_secs(60)),
            exporter.clone(),
            resource(),
        );

        for i in 0..5 {
            engine.add(record(i));
        }
        engine.shutdown().await;

        assert_eq!(exporter.bodies().len(), 5);
        assert!(!engine.is_accepting());
        assert!(!engine.add(record(99)));
        assert_eq!(engine.try_add(record(100)), Err(BufferError::Closed));
        assert!(!engine.add_timeout(record(101), Duration::from_millis(10)).await);

        // Second shutdown is a no-op.
        engine.shutdown().await;
        assert_eq!(engine.stats().records_accepted, 5);
        assert_eq!(engine.stats().records_dropped, 3);
    }

    #[tokio::test]
    async fn test_add_none_is_noop_success() {
        let exporter = Arc::new(RecordingExporter::new());
        let engine = BatchingEngine::start(
            EngineSettings::new(10, 10, Duration::from_secs(60)),
            exporter.clone(),
            resource(),
        );

        assert!(engine.add(None));
        engine.shutdown().await;
        assert_eq!(engine.stats(), EngineStats::default());
        assert!(exporter.batches().is_empty());
    }

    #[tokio::test]
    async fn test_add_timeout_accepts_when_space() {
        let exporter = Arc::new(RecordingExporter::new());
        let engine = BatchingEngine::start(
            EngineSettings::new(10, 10, Duration::from_secs(60)),
            exporter.clone(),
            resource(),
        );

        assert!(engine.add_timeout(record(0), Duration::from_millis(100)).await);
        engine.shutdown().await;
        assert_eq!(exporter.bodies(), vec!["record 0".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_export_is_counted_and_discarded() {
        let exporter = Arc::new(RecordingExporter::failing_first(1));
        let engine = BatchingEngine::start(
            EngineSettings::new(2, 10, Duration::from_secs(60)),
            exporter.clone(),
            resource(),
        );

        for i in 0..4 {
            engine.add(record(i));
        }
        engine.shutdown().await;

        let stats = engine.stats();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.batches_exported, 1);
        assert_eq!(exporter.bodies(), vec!["record 2".to_string(), "record 3".to_string()]);
    }
}
