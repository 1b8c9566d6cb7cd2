//! Instrument registry and periodic metric export.
//!
//! [`Meter`] hands out instruments; [`PeriodicMetricCollector`] snapshots every
//! registered instrument on a fixed interval and exports the points as one
//! batch. Counters and histograms both report cumulative state.

use crate::batch_processor::{duration_millis, export_with_timeout, ProcessorMetrics};
use crate::error::{ConfigError, ShutdownError};
use crate::exporter::{Batch, ExporterBoxed};
use crate::instrument::{Counter, Histogram, InstrumentKind, MetricPoint};
use crate::resource::Resource;
use crate::span::Clock;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Configuration for periodic metric export
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Time between collections
    #[serde(rename = "export_interval_ms", with = "duration_millis")]
    pub export_interval: Duration,
    /// Upper bound on a single export call
    #[serde(rename = "export_timeout_ms", with = "duration_millis")]
    pub export_timeout: Duration,
    /// Grace period for the final collection at shutdown
    #[serde(rename = "shutdown_timeout_ms", with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            export_interval: Duration::from_secs(60),
            export_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl MetricsConfig {
    pub fn with_export_interval(mut self, interval: Duration) -> Self {
        self.export_interval = interval;
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

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.export_interval.is_zero() || self.export_timeout.is_zero() {
            return Err(ConfigError::InvalidBatch(
                "metric export_interval and export_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Registered {
    Counter(Counter),
    Histogram(Histogram),
}

impl Registered {
    fn key(&self) -> (&str, InstrumentKind) {
        match self {
            Self::Counter(c) => (&c.descriptor().name, InstrumentKind::Counter),
            Self::Histogram(h) => (&h.descriptor().name, InstrumentKind::Histogram),
        }
    }

    fn collect(&self, timestamp: u64) -> Vec<MetricPoint> {
        match self {
            Self::Counter(c) => c.collect(timestamp),
            Self::Histogram(h) => h.collect(timestamp),
        }
    }
}

/// Registry of instruments, shared by everything that records metrics.
///
/// Registration is idempotent by `(name, kind)`: asking twice for the same
/// counter returns a handle to the same underlying series.
#[derive(Debug, Clone)]
pub struct Meter {
    inner: Arc<MeterInner>,
}

#[derive(Debug)]
struct MeterInner {
    instruments: Mutex<Vec<Registered>>,
    clock: Clock,
}

impl Meter {
    pub fn new(clock: Clock) -> Self {
        Self {
            inner: Arc::new(MeterInner {
                instruments: Mutex::new(Vec::new()),
                clock,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registered>> {
        self.inner
            .instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the counter named `name`, creating it on first use.
    pub fn counter(&self, name: &str, description: &str, unit: &str) -> Counter {
        let mut instruments = self.lock();
        for existing in instruments.iter() {
            if let Registered::Counter(c) = existing {
                if c.descriptor().name == name {
                    return c.clone();
                }
            }
        }
        let counter = Counter::new(name, description, unit, self.inner.clock.now_nanos());
        instruments.push(Registered::Counter(counter.clone()));
        counter
    }

    /// Returns the histogram named `name` with default bucket bounds.
    pub fn histogram(&self, name: &str, description: &str, unit: &str) -> Histogram {
        self.histogram_with_bounds(name, description, unit, None)
    }

    /// Returns the histogram named `name`, creating it with `bounds` on first use.
    ///
    /// Bounds are ignored when the histogram already exists.
    pub fn histogram_with_bounds(
        &self,
        name: &str,
        description: &str,
        unit: &str,
        bounds: Option<Vec<f64>>,
    ) -> Histogram {
        let mut instruments = self.lock();
        for existing in instruments.iter() {
            if let Registered::Histogram(h) = existing {
                if h.descriptor().name == name {
                    return h.clone();
                }
            }
        }
        let histogram =
            Histogram::new(name, description, unit, self.inner.clock.now_nanos(), bounds);
        instruments.push(Registered::Histogram(histogram.clone()));
        histogram
    }

    /// Number of distinct `(name, kind)` instruments.
    pub fn instrument_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether an instrument with this `(name, kind)` is registered.
    pub fn contains(&self, name: &str, kind: InstrumentKind) -> bool {
        self.lock().iter().any(|r| r.key() == (name, kind))
    }

    /// Snapshots every instrument, in registration order.
    pub fn collect(&self) -> Vec<MetricPoint> {
        let instruments: Vec<Registered> = self.lock().clone();
        let timestamp = self.inner.clock.now_nanos();
        instruments
            .iter()
            .flat_map(|instrument| instrument.collect(timestamp))
            .collect()
    }
}

enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Collects all instruments of a [`Meter`] on a fixed interval and exports them.
pub struct PeriodicMetricCollector {
    meter: Meter,
    config: MetricsConfig,
    metrics: Arc<ProcessorMetrics>,
    control: mpsc::UnboundedSender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicMetricCollector {
    /// Creates the collector and spawns its worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(
        config: MetricsConfig,
        meter: Meter,
        exporter: Arc<dyn ExporterBoxed<MetricPoint>>,
        resource: Arc<Resource>,
    ) -> Self {
        let metrics = Arc::new(ProcessorMetrics::default());
        let (control, control_rx) = mpsc::unbounded_channel();

        let worker = CollectorWorker {
            meter: meter.clone(),
            exporter,
            resource,
            export_timeout: config.export_timeout,
            metrics: Arc::clone(&metrics),
        };
        let handle = tokio::spawn(worker.run(config.export_interval, control_rx));

        Self {
            meter,
            config,
            metrics,
            control,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    /// Export outcome counters; `records_exported` counts metric points.
    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }

    /// Collects and exports immediately, waiting for the export to finish.
    pub async fn force_flush(&self) -> Result<(), ShutdownError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control
            .send(Control::Flush(ack_tx))
            .map_err(|_| ShutdownError::AlreadyShutDown("metrics"))?;
        ack_rx
            .await
            .map_err(|_| ShutdownError::AlreadyShutDown("metrics"))
    }

    /// Runs one final collection and export, then stops the worker.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ShutdownError::AlreadyShutDown("metrics"))?;
        let _ = self.control.send(Control::Shutdown);

        let grace = self.config.shutdown_timeout;
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ShutdownError::Worker {
                signal: "metrics",
                reason: e.to_string(),
            }),
            Err(_) => {
                abort.abort();
                Err(ShutdownError::Timeout {
                    signal: "metrics",
                    grace,
                })
            }
        }
    }
}

struct CollectorWorker {
    meter: Meter,
    exporter: Arc<dyn ExporterBoxed<MetricPoint>>,
    resource: Arc<Resource>,
    export_timeout: Duration,
    metrics: Arc<ProcessorMetrics>,
}

impl CollectorWorker {
    async fn run(self, period: Duration, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                msg = control.recv() => match msg {
                    Some(Control::Flush(ack)) => {
                        self.collect_and_export().await;
                        let _ = ack.send(());
                    }
                    Some(Control::Shutdown) | None => {
                        self.collect_and_export().await;
                        break;
                    }
                },

                _ = ticker.tick() => self.collect_and_export().await,
            }
        }
    }

    async fn collect_and_export(&self) {
        let points = self.meter.collect();
        if points.is_empty() {
            return;
        }
        let batch = Batch::with_records(Arc::clone(&self.resource), points);
        export_with_timeout(
            "metrics",
            self.exporter.as_ref(),
            batch,
            self.export_timeout,
            &self.metrics,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;
    use crate::instrument::{Labels, PointValue};

    fn resource() -> Arc<Resource> {
        Arc::new(Resource::builder("test").build().unwrap())
    }

    #[test]
    fn test_registration_is_idempotent() {
        let meter = Meter::new(Clock::new());
        let a = meter.counter("orders", "orders placed", "1");
        let b = meter.counter("orders", "ignored", "ignored");
        a.inc(&Labels::empty());
        b.inc(&Labels::empty());

        assert_eq!(a.value(&Labels::empty()), 2);
        assert_eq!(meter.instrument_count(), 1);
        assert_eq!(b.descriptor().description, "orders placed");
    }

    #[test]
    fn test_same_name_different_kind_are_distinct() {
        let meter = Meter::new(Clock::new());
        meter.counter("checkout", "", "1");
        meter.histogram("checkout", "", "ms");
        assert_eq!(meter.instrument_count(), 2);
        assert!(meter.contains("checkout", InstrumentKind::Counter));
        assert!(meter.contains("checkout", InstrumentKind::Histogram));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_export_is_cumulative() {
        let meter = Meter::new(Clock::new());
        let counter = meter.counter("requests", "", "1");
        let exporter = Arc::new(InMemoryExporter::new());
        let collector = PeriodicMetricCollector::new(
            MetricsConfig::default().with_export_interval(Duration::from_secs(1)),
            meter,
            exporter.clone(),
            resource(),
        );

        counter.add(3, &Labels::empty());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        counter.add(2, &Labels::empty());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let batches = exporter.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].value, PointValue::Sum(3));
        assert_eq!(batches[1][0].value, PointValue::Sum(5));
        assert!(batches[1][0].timestamp >= batches[0][0].timestamp);

        collector.shutdown().await.unwrap();
        assert_eq!(exporter.export_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_exported_without_points() {
        let meter = Meter::new(Clock::new());
        meter.counter("idle", "", "1");
        let exporter = Arc::new(InMemoryExporter::new());
        let collector = PeriodicMetricCollector::new(
            MetricsConfig::default().with_export_interval(Duration::from_secs(1)),
            meter,
            exporter.clone(),
            resource(),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        collector.shutdown().await.unwrap();
        assert_eq!(exporter.export_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_exports_immediately() {
        let meter = Meter::new(Clock::new());
        let hist = meter.histogram("latency", "", "ms");
        let exporter = Arc::new(InMemoryExporter::new());
        let collector = PeriodicMetricCollector::new(
            MetricsConfig::default(),
            meter,
            exporter.clone(),
            resource(),
        );

        hist.record(12.5, &Labels::new([("route", "/")]));
        collector.force_flush().await.unwrap();

        let points = exporter.records();
        assert_eq!(points.len(), 1);
        assert!(matches!(&points[0].value, PointValue::Histogram(h) if h.count == 1));
        assert_eq!(collector.metrics().records_exported(), 1);
        collector.shutdown().await.unwrap();
    }
}
