//! The telemetry context handed to the middleware and to handlers.
//!
//! One instance per process: built once at startup, shut down once before
//! exit. It is an ordinary value passed at construction time, so tests build
//! their own with in-memory exporters and nothing is global.

use crate::batch_processor::{BatchConfig, BatchExportProcessor};
use crate::config::{ExporterKind, PipelineConfig};
use crate::error::{ConfigError, ShutdownError};
use crate::exporter::{ExporterBoxed, NullExporter, StdoutExporter};
use crate::http_exporter::HttpExporter;
use crate::instrument::MetricPoint;
use crate::log_record::LogRecord;
use crate::logger::Logger;
use crate::metric_collector::{Meter, MetricsConfig, PeriodicMetricCollector};
use crate::otlp::OtlpSignal;
use crate::resource::Resource;
use crate::span::{Clock, Span};
use crate::tracer::Tracer;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Resource, tracer, logger and meter for one process.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    resource: Arc<Resource>,
    tracer: Tracer,
    logger: Logger,
    collector: PeriodicMetricCollector,
}

impl Telemetry {
    pub fn builder(resource: Resource) -> TelemetryBuilder {
        TelemetryBuilder::new(resource)
    }

    /// Validates `config` and wires exporters for every signal.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let resource = config.resource()?;
        let endpoints = &config.endpoints;

        let telemetry = Self::builder(resource)
            .with_traces(config.traces.clone())
            .with_logs(config.logs.clone())
            .with_metrics(config.metrics.clone())
            .with_span_exporter(exporter_for::<Span>(
                config.exporter,
                endpoints.traces_url(),
                config.traces.export_timeout,
            )?)
            .with_log_exporter(exporter_for::<LogRecord>(
                config.exporter,
                endpoints.logs_url(),
                config.logs.export_timeout,
            )?)
            .with_metric_exporter(exporter_for::<MetricPoint>(
                config.exporter,
                endpoints.metrics_url(),
                config.metrics.export_timeout,
            )?)
            .build();

        tracing::info!(
            service = telemetry.resource().service_name(),
            exporter = ?config.exporter,
            traces = %endpoints.traces_url(),
            logs = %endpoints.logs_url(),
            metrics = %endpoints.metrics_url(),
            "telemetry initialized"
        );
        Ok(telemetry)
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.inner.resource
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    pub fn meter(&self) -> &Meter {
        self.inner.collector.meter()
    }

    pub fn span_processor(&self) -> &Arc<BatchExportProcessor<Span>> {
        self.inner.tracer.processor()
    }

    pub fn log_processor(&self) -> &Arc<BatchExportProcessor<LogRecord>> {
        self.inner.logger.processor()
    }

    pub fn metric_collector(&self) -> &PeriodicMetricCollector {
        &self.inner.collector
    }

    /// Exports everything buffered in all three signals.
    pub async fn force_flush(&self) -> Result<(), ShutdownError> {
        let (spans, logs, metrics) = tokio::join!(
            self.span_processor().force_flush(),
            self.log_processor().force_flush(),
            self.inner.collector.force_flush(),
        );
        spans.and(logs).and(metrics)
    }

    /// Drains and flushes every signal, each within its own grace period.
    ///
    /// All three are attempted even if one fails; the first failure is
    /// returned.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let (spans, logs, metrics) = tokio::join!(
            self.span_processor().shutdown(),
            self.log_processor().shutdown(),
            self.inner.collector.shutdown(),
        );
        for result in [&spans, &logs, &metrics] {
            if let Err(error) = result {
                tracing::warn!(%error, "telemetry shutdown incomplete");
            }
        }
        tracing::info!(
            spans_dropped = self.span_processor().metrics().dropped(),
            logs_dropped = self.log_processor().metrics().dropped(),
            "telemetry shut down"
        );
        spans.and(logs).and(metrics)
    }
}

fn exporter_for<T>(
    kind: ExporterKind,
    endpoint: String,
    timeout: Duration,
) -> Result<Arc<dyn ExporterBoxed<T>>, ConfigError>
where
    T: OtlpSignal + Serialize,
{
    let exporter: Arc<dyn ExporterBoxed<T>> = match kind {
        ExporterKind::Otlp => Arc::new(HttpExporter::<T>::new(endpoint, timeout)?),
        ExporterKind::Stdout => Arc::new(StdoutExporter::new(true)),
        ExporterKind::None => Arc::new(NullExporter::new()),
    };
    Ok(exporter)
}

fn or_discard<T: Send + 'static>(
    exporter: Option<Arc<dyn ExporterBoxed<T>>>,
) -> Arc<dyn ExporterBoxed<T>> {
    match exporter {
        Some(exporter) => exporter,
        None => Arc::new(NullExporter::new()),
    }
}

/// Builder for [`Telemetry`]. Unset exporters discard their records.
pub struct TelemetryBuilder {
    resource: Resource,
    traces: BatchConfig,
    logs: BatchConfig,
    metrics: MetricsConfig,
    span_exporter: Option<Arc<dyn ExporterBoxed<Span>>>,
    log_exporter: Option<Arc<dyn ExporterBoxed<LogRecord>>>,
    metric_exporter: Option<Arc<dyn ExporterBoxed<MetricPoint>>>,
}

impl TelemetryBuilder {
    fn new(resource: Resource) -> Self {
        Self {
            resource,
            traces: BatchConfig::default(),
            logs: BatchConfig::default(),
            metrics: MetricsConfig::default(),
            span_exporter: None,
            log_exporter: None,
            metric_exporter: None,
        }
    }

    pub fn with_traces(mut self, config: BatchConfig) -> Self {
        self.traces = config;
        self
    }

    pub fn with_logs(mut self, config: BatchConfig) -> Self {
        self.logs = config;
        self
    }

    pub fn with_metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    pub fn with_span_exporter(mut self, exporter: Arc<dyn ExporterBoxed<Span>>) -> Self {
        self.span_exporter = Some(exporter);
        self
    }

    pub fn with_log_exporter(mut self, exporter: Arc<dyn ExporterBoxed<LogRecord>>) -> Self {
        self.log_exporter = Some(exporter);
        self
    }

    pub fn with_metric_exporter(mut self, exporter: Arc<dyn ExporterBoxed<MetricPoint>>) -> Self {
        self.metric_exporter = Some(exporter);
        self
    }

    /// Spawns the span, log and metric workers.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn build(self) -> Telemetry {
        let resource = Arc::new(self.resource);
        let clock = Clock::new();

        let spans = Arc::new(BatchExportProcessor::new(
            "traces",
            self.traces,
            or_discard(self.span_exporter),
            Arc::clone(&resource),
        ));
        let logs = Arc::new(BatchExportProcessor::new(
            "logs",
            self.logs,
            or_discard(self.log_exporter),
            Arc::clone(&resource),
        ));
        let collector = PeriodicMetricCollector::new(
            self.metrics,
            Meter::new(clock),
            or_discard(self.metric_exporter),
            Arc::clone(&resource),
        );

        Telemetry {
            inner: Arc::new(TelemetryInner {
                resource,
                tracer: Tracer::new(spans, clock),
                logger: Logger::new(logs, clock),
                collector,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use crate::exporter::InMemoryExporter;
    use crate::instrument::Labels;
    use crate::tracer::Context;

    #[tokio::test]
    async fn test_shutdown_drains_every_signal() {
        let spans = Arc::new(InMemoryExporter::<Span>::new());
        let logs = Arc::new(InMemoryExporter::<LogRecord>::new());
        let metrics = Arc::new(InMemoryExporter::<MetricPoint>::new());
        let telemetry = Telemetry::builder(Resource::builder("svc").build().unwrap())
            .with_span_exporter(spans.clone())
            .with_log_exporter(logs.clone())
            .with_metric_exporter(metrics.clone())
            .build();

        let span = telemetry.tracer().start_span(&Context::root(), "op");
        telemetry.logger().info(&span.context(), "hello");
        telemetry
            .meter()
            .counter("ops", "", "1")
            .inc(&Labels::empty());
        span.end();

        telemetry.shutdown().await.unwrap();
        assert_eq!(spans.exported_count(), 1);
        assert_eq!(logs.exported_count(), 1);
        assert_eq!(metrics.exported_count(), 1);

        assert_eq!(
            telemetry.shutdown().await,
            Err(ShutdownError::AlreadyShutDown("traces"))
        );
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_endpoint() {
        let config = PipelineConfig::default()
            .with_transport(Transport::Tls)
            .with_collector("http://plaintext:4318");
        assert!(matches!(
            Telemetry::from_config(&config),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_from_config_builds_with_default_collector() {
        let telemetry = Telemetry::from_config(&PipelineConfig::default()).unwrap();
        assert_eq!(telemetry.resource().service_name(), "flask-app");
        telemetry.shutdown().await.unwrap();
    }
}
