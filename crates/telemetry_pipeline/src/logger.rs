//! Log correlation bridge: telemetry log records stamped with the active span.
//!
//! These records form their own signal and never pass through `tracing`; the
//! pipeline's own diagnostics use `tracing`, so emitting here cannot recurse
//! into the log processor.

use crate::batch_processor::BatchExportProcessor;
use crate::log_record::{LogRecord, Severity};
use crate::span::Clock;
use crate::tracer::Context;
use std::sync::Arc;

/// Emits correlated log records into the log processor.
#[derive(Clone)]
pub struct Logger {
    processor: Arc<BatchExportProcessor<LogRecord>>,
    clock: Clock,
    min_severity: Severity,
}

impl Logger {
    pub fn new(processor: Arc<BatchExportProcessor<LogRecord>>, clock: Clock) -> Self {
        Self {
            processor,
            clock,
            min_severity: Severity::Debug,
        }
    }

    /// Records below `severity` are discarded at the call site.
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    /// Emits `body` at `severity`, correlated with the span active in `cx`.
    ///
    /// With no active span the correlation fields stay empty. Returns `false`
    /// if the record was filtered or dropped; callers are free to ignore it.
    pub fn emit(&self, cx: &Context, severity: Severity, body: impl Into<String>) -> bool {
        if severity < self.min_severity {
            return false;
        }
        let record = LogRecord::new(self.clock.now_nanos(), severity, body, cx.active_span());
        self.processor.enqueue(record)
    }

    pub fn debug(&self, cx: &Context, body: impl Into<String>) -> bool {
        self.emit(cx, Severity::Debug, body)
    }

    pub fn info(&self, cx: &Context, body: impl Into<String>) -> bool {
        self.emit(cx, Severity::Info, body)
    }

    pub fn warn(&self, cx: &Context, body: impl Into<String>) -> bool {
        self.emit(cx, Severity::Warn, body)
    }

    pub fn error(&self, cx: &Context, body: impl Into<String>) -> bool {
        self.emit(cx, Severity::Error, body)
    }

    pub fn processor(&self) -> &Arc<BatchExportProcessor<LogRecord>> {
        &self.processor
    }
}
