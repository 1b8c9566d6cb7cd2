use crate::resource::Resource;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Error types for batch export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (connect, TLS, I/O)
    #[error("transport error: {0}")]
    Transport(String),
    /// The collector answered with a non-success status
    #[error("collector at {endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation exceeded the configured export timeout
    #[error("export operation timed out after {0:?}")]
    Timeout(Duration),
}

/// A group of records of one signal kind, handed to an exporter in one call.
#[derive(Debug)]
pub struct Batch<T> {
    /// Records in enqueue order
    pub records: Vec<T>,
    /// Identity of the emitting process
    pub resource: Arc<Resource>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

impl<T> Batch<T> {
    /// Creates a batch with the given records
    pub fn with_records(resource: Arc<Resource>, records: Vec<T>) -> Self {
        Self {
            records,
            resource,
            timestamp: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Trait for exporting batches of one signal kind to a backend.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn ExporterBoxed<T>>`; every `Exporter<T>`
/// gets that impl for free.
pub trait Exporter<T>: Send + Sync {
    /// Exports a batch. May fail; callers treat failures as a dropped batch.
    fn export(&self, batch: Batch<T>) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for diagnostics.
    fn name(&self) -> &str;
}

/// Object-safe version of [`Exporter`] for dynamic dispatch.
pub trait ExporterBoxed<T>: Send + Sync {
    /// Exports a batch (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: Batch<T>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for diagnostics.
    fn name(&self) -> &str;
}

/// Blanket implementation: any Exporter can be used as ExporterBoxed
impl<T: Send + 'static, E: Exporter<T>> ExporterBoxed<T> for E {
    fn export_boxed(
        &self,
        batch: Batch<T>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        Exporter::name(self)
    }
}

/// Stdout exporter for local runs and debugging
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    /// Creates a new stdout exporter; a silent one only counts records.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl<T: Serialize + Send + Sync + 'static> Exporter<T> for StdoutExporter {
    async fn export(&self, batch: Batch<T>) -> Result<(), ExportError> {
        if self.verbose {
            println!(
                "=== [{}] exporting {} records ===",
                batch.resource.service_name(),
                batch.len()
            );
            for record in &batch.records {
                let line = serde_json::to_string(record)
                    .map_err(|e| ExportError::Serialization(e.to_string()))?;
                println!("{}", line);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Null exporter that discards all records (for benchmarking)
#[derive(Debug, Default)]
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Send + 'static> Exporter<T> for NullExporter {
    async fn export(&self, _batch: Batch<T>) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Exporter that keeps every batch in memory, for tests and local inspection.
///
/// Batch boundaries are preserved so callers can count export calls.
pub struct InMemoryExporter<T> {
    batches: Mutex<Vec<Vec<T>>>,
}

impl<T> Default for InMemoryExporter<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> InMemoryExporter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `export` calls so far.
    pub fn export_calls(&self) -> usize {
        self.lock().len()
    }

    /// Total records exported across all calls.
    pub fn exported_count(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }

    /// Copy of every batch, in export order.
    pub fn batches(&self) -> Vec<Vec<T>> {
        self.lock().clone()
    }

    /// All exported records flattened in export order.
    pub fn records(&self) -> Vec<T> {
        self.lock().iter().flatten().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<T>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Exporter<T> for InMemoryExporter<T> {
    async fn export(&self, batch: Batch<T>) -> Result<(), ExportError> {
        self.lock().push(batch.records);
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Exporter that fails every call, for fault-injection tests
#[cfg(test)]
pub(crate) struct FailingExporter {
    pub(crate) attempts: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FailingExporter {
    pub(crate) fn new() -> Self {
        Self {
            attempts: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
impl<T: Send + 'static> Exporter<T> for FailingExporter {
    async fn export(&self, _batch: Batch<T>) -> Result<(), ExportError> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(ExportError::Transport("connection refused".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Slow exporter for timeout testing
#[cfg(test)]
pub(crate) struct SlowExporter<T> {
    pub(crate) delay: Duration,
    pub(crate) inner: InMemoryExporter<T>,
}

#[cfg(test)]
impl<T: Clone> SlowExporter<T> {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: InMemoryExporter::new(),
        }
    }
}

#[cfg(test)]
impl<T: Clone + Send + Sync + 'static> Exporter<T> for SlowExporter<T> {
    async fn export(&self, batch: Batch<T>) -> Result<(), ExportError> {
        tokio::time::sleep(self.delay).await;
        self.inner.export(batch).await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> Arc<Resource> {
        Arc::new(Resource::builder("test").build().unwrap())
    }

    #[tokio::test]
    async fn test_stdout_exporter() {
        let exporter = StdoutExporter::new(false);
        let batch = Batch::with_records(resource(), vec!["record".to_string()]);

        let result = Exporter::export(&exporter, batch).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_null_exporter() {
        let exporter = NullExporter::new();
        let batch = Batch::with_records(resource(), (0..1000u64).collect());

        let result = exporter.export(batch).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_exporter_keeps_batch_boundaries() {
        let exporter = InMemoryExporter::new();
        exporter
            .export(Batch::with_records(resource(), vec![1, 2, 3]))
            .await
            .unwrap();
        exporter
            .export(Batch::with_records(resource(), vec![4]))
            .await
            .unwrap();

        assert_eq!(exporter.export_calls(), 2);
        assert_eq!(exporter.exported_count(), 4);
        assert_eq!(exporter.batches(), vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(exporter.records(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_boxed_dispatch() {
        let exporter: Arc<dyn ExporterBoxed<u32>> = Arc::new(InMemoryExporter::<u32>::new());
        exporter
            .export_boxed(Batch::with_records(resource(), vec![7]))
            .await
            .unwrap();
        assert_eq!(exporter.name(), "in_memory");
    }
}
