//! Batch Export Processor
//!
//! Buffers records of one signal kind in memory and ships them to an exporter
//! from a dedicated background task. One instance exists per signal (spans,
//! logs); the type is generic over the record.
//!
//! # Flush triggers
//!
//! The worker wakes on whichever comes first:
//!
//! - the buffer reaching `max_export_batch_size` (producers signal a `Notify`)
//! - `scheduled_delay` elapsing since the previous flush
//! - an explicit [`BatchExportProcessor::force_flush`] or
//!   [`BatchExportProcessor::shutdown`]
//!
//! Scheduled flushes export at most `max_export_batch_size` records per call,
//! one call after another, so records leave in enqueue order. The final flush
//! at shutdown exports everything that is left in a single call.
//!
//! # Delivery semantics
//!
//! Best effort, at most once. `enqueue` never blocks and never fails loudly:
//! when the buffer is full the incoming record is dropped and counted. Export
//! failures and timeouts are logged, counted, and the batch is discarded.
//!
//! ```rust,ignore
//! let processor = BatchExportProcessor::new("traces", BatchConfig::default(), exporter, resource);
//! processor.enqueue(span);
//! processor.shutdown().await?;
//! ```

use crate::error::{ConfigError, ShutdownError};
use crate::exporter::{Batch, ExportError, ExporterBoxed};
use crate::resource::Resource;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for batch processing
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Buffer capacity; records beyond it are dropped
    pub max_queue_size: usize,
    /// Maximum number of records per scheduled export call
    pub max_export_batch_size: usize,
    /// Maximum time between flushes
    #[serde(rename = "scheduled_delay_ms", with = "duration_millis")]
    pub scheduled_delay: Duration,
    /// Upper bound on a single export call
    #[serde(rename = "export_timeout_ms", with = "duration_millis")]
    pub export_timeout: Duration,
    /// Grace period for the final flush at shutdown
    #[serde(rename = "shutdown_timeout_ms", with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
            export_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    pub fn with_scheduled_delay(mut self, delay: Duration) -> Self {
        self.scheduled_delay = delay;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Rejects sizes and delays the worker cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_export_batch_size == 0 {
            return Err(ConfigError::InvalidBatch(
                "max_export_batch_size must be at least 1".into(),
            ));
        }
        if self.max_export_batch_size > self.max_queue_size {
            return Err(ConfigError::InvalidBatch(format!(
                "max_export_batch_size {} exceeds max_queue_size {}",
                self.max_export_batch_size, self.max_queue_size
            )));
        }
        if self.scheduled_delay.is_zero() || self.export_timeout.is_zero() {
            return Err(ConfigError::InvalidBatch(
                "scheduled_delay and export_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Serde helper: durations as integer milliseconds in config files.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Thread-safe processor counters
///
/// All loads and stores are `Relaxed`: these are statistics and guard no data.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    records_exported: AtomicU64,
    batches_exported: AtomicU64,
    export_errors: AtomicU64,
    export_timeouts: AtomicU64,
}

impl ProcessorMetrics {
    /// Records accepted into the buffer
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Records rejected (buffer full or processor shut down)
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn records_exported(&self) -> u64 {
        self.records_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    /// Export calls that returned an error (timeouts excluded)
    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn export_timeouts(&self) -> u64 {
        self.export_timeouts.load(Ordering::Relaxed)
    }

    fn record_success(&self, records: u64) {
        self.records_exported.fetch_add(records, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }
}

enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct Shared<T> {
    buffer: Mutex<Vec<T>>,
    /// Set under the buffer lock so no record slips in after the final swap.
    closed: AtomicBool,
    batch_ready: Notify,
    config: BatchConfig,
    metrics: ProcessorMetrics,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swaps out up to `limit` records from the front of the buffer.
    fn take_up_to(&self, limit: usize) -> Vec<T> {
        let mut buffer = self.lock();
        if buffer.len() <= limit {
            std::mem::take(&mut *buffer)
        } else {
            buffer.drain(..limit).collect()
        }
    }
}

/// Buffers records of one signal kind and exports them from a background task.
pub struct BatchExportProcessor<T> {
    signal: &'static str,
    shared: Arc<Shared<T>>,
    control: mpsc::UnboundedSender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchExportProcessor<T> {
    /// Creates the processor and spawns its worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        signal: &'static str,
        config: BatchConfig,
        exporter: Arc<dyn ExporterBoxed<T>>,
        resource: Arc<Resource>,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Vec::with_capacity(config.max_export_batch_size)),
            closed: AtomicBool::new(false),
            batch_ready: Notify::new(),
            config,
            metrics: ProcessorMetrics::default(),
        });
        let (control, control_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            signal,
            shared: Arc::clone(&shared),
            exporter,
            resource,
        };
        let handle = tokio::spawn(worker.run(control_rx));

        Self {
            signal,
            shared,
            control,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Adds a record without blocking.
    ///
    /// Returns `false` if the record was dropped because the buffer is full or
    /// the processor is shut down. Drops are counted in [`ProcessorMetrics`].
    pub fn enqueue(&self, record: T) -> bool {
        let config = &self.shared.config;
        let len = {
            let mut buffer = self.shared.lock();
            if self.shared.closed.load(Ordering::Acquire) || buffer.len() >= config.max_queue_size
            {
                drop(buffer);
                self.shared.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            buffer.push(record);
            debug_assert_within_capacity!(buffer.len(), config.max_queue_size);
            buffer.len()
        };
        self.shared.metrics.enqueued.fetch_add(1, Ordering::Relaxed);

        if len >= config.max_export_batch_size {
            self.shared.batch_ready.notify_one();
        }
        true
    }

    /// Number of records waiting for export.
    pub fn pending(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.shared.metrics
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    pub fn signal(&self) -> &'static str {
        self.signal
    }

    /// Exports everything currently buffered and waits for those exports.
    pub async fn force_flush(&self) -> Result<(), ShutdownError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control
            .send(Control::Flush(ack_tx))
            .map_err(|_| ShutdownError::AlreadyShutDown(self.signal))?;
        ack_rx
            .await
            .map_err(|_| ShutdownError::AlreadyShutDown(self.signal))
    }

    /// Stops accepting records, runs one final flush and waits for it.
    ///
    /// Waits at most `shutdown_timeout`; past that the worker is aborted and
    /// whatever it still held is lost.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ShutdownError::AlreadyShutDown(self.signal))?;

        {
            let _buffer = self.shared.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        // The worker treats a closed channel as shutdown too.
        let _ = self.control.send(Control::Shutdown);

        let grace = self.shared.config.shutdown_timeout;
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => {
                tracing::debug!(signal = self.signal, "processor shut down");
                Ok(())
            }
            Ok(Err(e)) => Err(ShutdownError::Worker {
                signal: self.signal,
                reason: e.to_string(),
            }),
            Err(_) => {
                abort.abort();
                tracing::warn!(signal = self.signal, ?grace, "final flush exceeded grace period");
                Err(ShutdownError::Timeout {
                    signal: self.signal,
                    grace,
                })
            }
        }
    }
}

struct Worker<T> {
    signal: &'static str,
    shared: Arc<Shared<T>>,
    exporter: Arc<dyn ExporterBoxed<T>>,
    resource: Arc<Resource>,
}

impl<T: Send + 'static> Worker<T> {
    async fn run(self, mut control: mpsc::UnboundedReceiver<Control>) {
        let delay = self.shared.config.scheduled_delay;
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                // Shutdown and flush requests win over scheduled work.
                biased;

                msg = control.recv() => match msg {
                    Some(Control::Flush(ack)) => {
                        self.export_all().await;
                        last_flush = Instant::now();
                        let _ = ack.send(());
                    }
                    Some(Control::Shutdown) | None => {
                        self.final_flush().await;
                        break;
                    }
                },

                () = self.shared.batch_ready.notified() => {
                    self.export_full_batches().await;
                    last_flush = Instant::now();
                }

                () = tokio::time::sleep_until(last_flush + delay) => {
                    self.export_all().await;
                    last_flush = Instant::now();
                }
            }
        }
    }

    /// Exports batches while a full one is available.
    async fn export_full_batches(&self) {
        let limit = self.shared.config.max_export_batch_size;
        while self.shared.lock().len() >= limit {
            let records = self.shared.take_up_to(limit);
            self.export(records).await;
        }
    }

    /// Exports the whole buffer in batches of at most `max_export_batch_size`.
    async fn export_all(&self) {
        let limit = self.shared.config.max_export_batch_size;
        loop {
            let records = self.shared.take_up_to(limit);
            if records.is_empty() {
                break;
            }
            debug_assert_batch_bounded!(records.len(), limit);
            self.export(records).await;
        }
    }

    async fn final_flush(&self) {
        let records = std::mem::take(&mut *self.shared.lock());
        if !records.is_empty() {
            tracing::debug!(signal = self.signal, records = records.len(), "final flush");
            self.export(records).await;
        }
    }

    async fn export(&self, records: Vec<T>) {
        let batch = Batch::with_records(Arc::clone(&self.resource), records);
        export_with_timeout(
            self.signal,
            self.exporter.as_ref(),
            batch,
            self.shared.config.export_timeout,
            &self.shared.metrics,
        )
        .await;
    }
}

/// Runs one export bounded by `timeout`, recording the outcome in `metrics`.
///
/// Failures are logged and swallowed; the batch is gone either way.
pub(crate) async fn export_with_timeout<T: Send + 'static>(
    signal: &'static str,
    exporter: &dyn ExporterBoxed<T>,
    batch: Batch<T>,
    timeout: Duration,
    metrics: &ProcessorMetrics,
) {
    let count = batch.len() as u64;
    // The exporter may enforce its own deadline; both surface as `Timeout`.
    let outcome = match tokio::time::timeout(timeout, exporter.export_boxed(batch)).await {
        Ok(result) => result,
        Err(_) => Err(ExportError::Timeout(timeout)),
    };
    match outcome {
        Ok(()) => metrics.record_success(count),
        Err(ExportError::Timeout(after)) => {
            metrics.export_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                signal,
                exporter = exporter.name(),
                records = count,
                timeout = ?after,
                "export timed out, dropping batch"
            );
        }
        Err(error) => {
            metrics.export_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                signal,
                exporter = exporter.name(),
                records = count,
                %error,
                "export failed, dropping batch"
            );
        }
    }
}
