use crate::span::SpanContext;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Upper-case severity text (`"INFO"`, `"ERROR"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    /// OpenTelemetry severity number for the first slot of each range.
    pub fn number(self) -> u8 {
        match self {
            Self::Debug => 5,
            Self::Info => 9,
            Self::Warn => 13,
            Self::Error => 17,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single log entry, correlated with the span active when it was emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emission time (Unix nanoseconds)
    pub timestamp: u64,
    pub severity: Severity,
    pub body: String,
    /// Trace id of the active span, `None` when emitted outside any span
    pub trace_id: Option<u128>,
    /// Span id of the active span, `None` when emitted outside any span
    pub span_id: Option<u64>,
}

impl LogRecord {
    pub fn new(
        timestamp: u64,
        severity: Severity,
        body: impl Into<String>,
        active: Option<SpanContext>,
    ) -> Self {
        Self {
            timestamp,
            severity,
            body: body.into(),
            trace_id: active.map(|c| c.trace_id),
            span_id: active.map(|c| c.span_id),
        }
    }

    /// The correlated span, if any.
    pub fn span_context(&self) -> Option<SpanContext> {
        match (self.trace_id, self.span_id) {
            (Some(trace_id), Some(span_id)) => Some(SpanContext { trace_id, span_id }),
            _ => None,
        }
    }

    pub fn is_correlated(&self) -> bool {
        self.span_context().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlated_record() {
        let ctx = SpanContext {
            trace_id: 11,
            span_id: 22,
        };
        let record = LogRecord::new(1, Severity::Info, "hello", Some(ctx));
        assert!(record.is_correlated());
        assert_eq!(record.span_context(), Some(ctx));
    }

    #[test]
    fn test_uncorrelated_record_has_empty_fields() {
        let record = LogRecord::new(1, Severity::Warn, "no span", None);
        assert_eq!(record.trace_id, None);
        assert_eq!(record.span_id, None);
        assert!(!record.is_correlated());
    }

    #[test]
    fn test_severity_ordering_and_text() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warn < Severity::Error);
        assert_eq!(Severity::Error.to_string(), "ERROR");
        assert_eq!(Severity::Info.number(), 9);
    }
}
