use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Represents a single distributed tracing span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Trace identifier (128-bit), shared by every span of one request
    pub trace_id: u128,
    /// Span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (`None` for a root span)
    pub parent_span_id: Option<u64>,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds), unset while the span is open
    pub end_time: Option<u64>,
    /// Operation name
    pub name: String,
    /// Span attributes
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Span status
    pub status: SpanStatus,
    /// Span kind
    pub kind: SpanKind,
}

/// Attribute value types for span and resource metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span status unknown
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side span for an inbound request
    Server,
    /// Client-side span for an outbound call
    Client,
}

/// The identifiers needed to parent a new span or correlate a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

impl SpanContext {
    /// Lowercase 32-digit hex trace id, the form collectors expect.
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    /// Lowercase 16-digit hex span id.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }
}

impl fmt::Display for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}/{:016x}", self.trace_id, self.span_id)
    }
}

impl Span {
    /// Creates an open span started at `start_time`
    pub fn new(
        context: SpanContext,
        parent_span_id: Option<u64>,
        name: String,
        kind: SpanKind,
        start_time: u64,
    ) -> Self {
        Self {
            trace_id: context.trace_id,
            span_id: context.span_id,
            parent_span_id,
            start_time,
            end_time: None,
            name,
            attributes: BTreeMap::new(),
            status: SpanStatus::Unset,
            kind,
        }
    }

    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
        }
    }

    /// Marks the span as ended. The end time is clamped so it never precedes the start.
    pub fn finish(&mut self, end_time: u64) {
        let end_time = end_time.max(self.start_time);
        debug_assert_span_ordered!(self.start_time, end_time);
        self.end_time = Some(end_time);
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// Duration of the span in nanoseconds (zero while open)
    pub fn duration_nanos(&self) -> u64 {
        self.end_time
            .map_or(0, |end| end.saturating_sub(self.start_time))
    }
}

/// Random, never-zero trace and span identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new_trace_id(&self) -> u128 {
        loop {
            let id: u128 = rand::random();
            if id != 0 {
                return id;
            }
        }
    }

    pub fn new_span_id(&self) -> u64 {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return id;
            }
        }
    }
}

/// Wall-clock timestamps derived from a monotonic source.
///
/// Anchored once against `SystemTime`, then advanced with `Instant`, so two
/// readings taken in order never go backwards even if the system clock is
/// adjusted while spans are open.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_unix_nanos: u64,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        let anchor_unix_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self {
            anchor_unix_nanos,
            anchor: Instant::now(),
        }
    }

    /// Current time in Unix nanoseconds.
    pub fn now_nanos(&self) -> u64 {
        self.anchor_unix_nanos
            .saturating_add(self.anchor.elapsed().as_nanos() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SpanContext {
        SpanContext {
            trace_id: 0xabc,
            span_id: 0x1,
        }
    }

    #[test]
    fn test_span_open_then_finished() {
        let mut span = Span::new(ctx(), None, "op".to_string(), SpanKind::Internal, 100);
        assert!(!span.is_ended());
        assert_eq!(span.duration_nanos(), 0);

        span.finish(250);
        assert_eq!(span.end_time, Some(250));
        assert_eq!(span.duration_nanos(), 150);
    }

    #[test]
    fn test_finish_never_precedes_start() {
        let mut span = Span::new(ctx(), Some(7), "op".to_string(), SpanKind::Internal, 500);
        span.finish(400);
        assert_eq!(span.end_time, Some(500));
    }

    #[test]
    fn test_hex_formatting() {
        let c = SpanContext {
            trace_id: 0x1f,
            span_id: 0x2a,
        };
        assert_eq!(c.trace_id_hex(), "0000000000000000000000000000001f");
        assert_eq!(c.span_id_hex(), "000000000000002a");
        assert_eq!(c.to_string(), format!("{}/{}", c.trace_id_hex(), c.span_id_hex()));
    }

    #[test]
    fn test_ids_are_non_zero_and_distinct() {
        let ids = IdGenerator;
        let a = ids.new_span_id();
        let b = ids.new_span_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_ne!(ids.new_trace_id(), 0);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let mut last = clock.now_nanos();
        for _ in 0..1000 {
            let now = clock.now_nanos();
            assert!(now >= last);
            last = now;
        }
    }
}
