//! Span lifecycle: `created → open → ended`.
//!
//! The active span is carried in an explicit [`Context`] value that callers
//! pass down their own call chain. Two concurrent requests each hold their own
//! `Context`, so neither can observe the other's spans. Nesting follows the
//! call structure: a child is started from the context of its parent's
//! [`ActiveSpan`] and, being scoped inside it, ends first.

use crate::batch_processor::BatchExportProcessor;
use crate::span::{AttributeValue, Clock, IdGenerator, Span, SpanContext, SpanKind, SpanStatus};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// Which span, if any, is active for the current unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    active: Option<SpanContext>,
}

impl Context {
    /// A context with no active span (start of a new trace).
    pub fn root() -> Self {
        Self::default()
    }

    pub fn active_span(&self) -> Option<SpanContext> {
        self.active
    }

    fn with_active(span: SpanContext) -> Self {
        Self { active: Some(span) }
    }
}

/// Creates spans and hands ended spans to the trace processor.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    processor: Arc<BatchExportProcessor<Span>>,
    ids: IdGenerator,
    clock: Clock,
}

impl Tracer {
    pub fn new(processor: Arc<BatchExportProcessor<Span>>, clock: Clock) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                processor,
                ids: IdGenerator,
                clock,
            }),
        }
    }

    /// Starts an internal span under whatever is active in `parent`.
    pub fn start_span(&self, parent: &Context, name: impl Into<String>) -> ActiveSpan {
        self.start_span_with_kind(parent, name, SpanKind::Internal)
    }

    /// Starts a span of the given kind.
    ///
    /// The trace id is inherited from the parent when there is one, otherwise a
    /// new trace begins.
    pub fn start_span_with_kind(
        &self,
        parent: &Context,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> ActiveSpan {
        let ids = &self.inner.ids;
        let (trace_id, parent_span_id) = match parent.active_span() {
            Some(p) => (p.trace_id, Some(p.span_id)),
            None => (ids.new_trace_id(), None),
        };
        let context = SpanContext {
            trace_id,
            span_id: ids.new_span_id(),
        };
        let span = Span::new(
            context,
            parent_span_id,
            name.into(),
            kind,
            self.inner.clock.now_nanos(),
        );
        ActiveSpan {
            span: Some(span),
            span_context: context,
            tracer: self.clone(),
        }
    }

    /// Runs `f` inside a child span that ends on every exit path.
    ///
    /// An `Err` marks the span as failed; the error is returned untouched.
    pub async fn in_span<F, Fut, T, E>(&self, parent: &Context, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut span = self.start_span(parent, name);
        let result = f(span.context()).await;
        if let Err(error) = &result {
            span.record_error(error);
        }
        span.end();
        result
    }

    pub fn processor(&self) -> &Arc<BatchExportProcessor<Span>> {
        &self.inner.processor
    }

    fn finish(&self, mut span: Span, panicking: bool) {
        if panicking && span.status != SpanStatus::Error {
            span.status = SpanStatus::Error;
            span.set_attribute("error.message", "panicked");
        }
        span.finish(self.inner.clock.now_nanos());
        self.inner.processor.enqueue(span);
    }
}

/// An open span. Ends (and is queued for export) exactly once: on
/// [`ActiveSpan::end`] or, failing that, when dropped.
pub struct ActiveSpan {
    span: Option<Span>,
    span_context: SpanContext,
    tracer: Tracer,
}

impl ActiveSpan {
    /// Context with this span active, for starting children or logging.
    pub fn context(&self) -> Context {
        Context::with_active(self.span_context)
    }

    pub fn span_context(&self) -> SpanContext {
        self.span_context
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(span) = self.span.as_mut() {
            span.set_attribute(key, value);
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(span) = self.span.as_mut() {
            span.status = status;
        }
    }

    /// Marks the span failed and records the error text.
    pub fn record_error(&mut self, error: &dyn Display) {
        if let Some(span) = self.span.as_mut() {
            span.status = SpanStatus::Error;
            span.set_attribute("error.message", error.to_string());
        }
    }

    /// Ends the span now.
    pub fn end(mut self) {
        if let Some(span) = self.span.take() {
            self.tracer.finish(span, false);
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            self.tracer.finish(span, std::thread::panicking());
        }
    }
}
