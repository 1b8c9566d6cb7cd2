//! Telemetry Pipeline
//!
//! Batches trace spans, log records and metric points in memory and ships them
//! to a collector from background workers, plus the per-request
//! instrumentation that feeds it.
//!
//! ```text
//! middleware ─► tracer / logger / meter ─► per-signal buffer ─► worker ─► exporter ─► collector
//! ```
//!
//! - [`BatchExportProcessor`] buffers one signal kind, flushing on size or timer
//! - [`PeriodicMetricCollector`] snapshots cumulative instruments on an interval
//! - [`Tracer`] manages the span lifecycle through an explicit [`Context`]
//! - [`Logger`] stamps log records with the active span
//! - [`InstrumentedRouter`] wraps every request in a root span and request metrics
//!
//! Delivery is best effort and at most once: enqueueing never blocks and the
//! pipeline never fails a request.
//!
//! ```rust,ignore
//! let telemetry = Telemetry::from_config(&PipelineConfig::load(None)?)?;
//! let app = InstrumentedRouter::new(handlers::routes(&telemetry), telemetry.clone());
//! let response = app.handle(Method::GET, "/db").await;
//! telemetry.shutdown().await?;
//! ```

#[macro_use]
mod invariants;

pub mod batch_processor;
pub mod config;
pub mod error;
pub mod exporter;
pub mod handlers;
pub mod http_exporter;
pub mod instrument;
pub mod log_record;
pub mod logger;
pub mod metric_collector;
pub mod middleware;
pub mod otlp;
pub mod resource;
pub mod router;
pub mod span;
pub mod telemetry;
pub mod tracer;

// Re-export main types
pub use batch_processor::{BatchConfig, BatchExportProcessor, ProcessorMetrics};
pub use config::{ExporterKind, PipelineConfig, Transport};
pub use error::{ConfigError, ShutdownError};
pub use exporter::{
    Batch, ExportError, Exporter, ExporterBoxed, InMemoryExporter, NullExporter, StdoutExporter,
};
pub use http_exporter::HttpExporter;
pub use instrument::{Counter, Histogram, HistogramSnapshot, Labels, MetricPoint, PointValue};
pub use log_record::{LogRecord, Severity};
pub use logger::Logger;
pub use metric_collector::{Meter, MetricsConfig, PeriodicMetricCollector};
pub use middleware::{InstrumentedRouter, FAULT_MESSAGE, UNMATCHED_ROUTE};
pub use otlp::OtlpSignal;
pub use resource::Resource;
pub use router::{Handler, HandlerBoxed, HandlerError, RequestContext, Response, Router};
pub use span::{AttributeValue, Span, SpanContext, SpanKind, SpanStatus};
pub use telemetry::{Telemetry, TelemetryBuilder};
pub use tracer::{ActiveSpan, Context, Tracer};

pub use http::{Method, StatusCode};
