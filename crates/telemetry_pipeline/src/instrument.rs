//! Metric instruments: cumulative counters and histograms keyed by label set.
//!
//! Both instruments are cheap to clone (they share state behind an `Arc`) and
//! safe to update from any number of concurrent requests. Updates never touch
//! the network; the [`crate::metric_collector::PeriodicMetricCollector`]
//! snapshots them on its own schedule.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Explicit histogram bucket upper bounds used when none are supplied.
pub const DEFAULT_HISTOGRAM_BOUNDS: &[f64] = &[
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0,
    7500.0, 10000.0,
];

/// A sorted, de-duplicated set of `key=value` labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        // Last write wins for a repeated key.
        pairs.reverse();
        pairs.dedup_by(|a, b| a.0 == b.0);
        pairs.reverse();
        Self(pairs)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Instrument kind; registration is idempotent per `(name, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    Counter,
    Histogram,
}

/// Name, description and unit shared by every point of one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: InstrumentKind,
}

/// An immutable snapshot of one `(instrument, label set)` series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub descriptor: Descriptor,
    pub labels: Labels,
    /// Start of the cumulative window (instrument creation, Unix nanoseconds)
    pub start_time: u64,
    /// Collection time (Unix nanoseconds)
    pub timestamp: u64,
    pub value: PointValue,
}

/// Cumulative value carried by a [`MetricPoint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PointValue {
    /// Monotonic cumulative sum
    Sum(u64),
    Histogram(HistogramSnapshot),
}

/// Cumulative histogram state at collection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    /// Upper bounds; `bucket_counts` has one extra overflow slot
    pub bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// COUNTER
// =============================================================================

/// Monotonic counter. Accumulates non-negative increments per label set.
#[derive(Debug, Clone)]
pub struct Counter {
    inner: Arc<CounterInner>,
}

#[derive(Debug)]
struct CounterInner {
    descriptor: Descriptor,
    start_time: u64,
    series: Mutex<HashMap<Labels, u64>>,
}

impl Counter {
    pub(crate) fn new(name: &str, description: &str, unit: &str, start_time: u64) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                descriptor: Descriptor {
                    name: name.to_string(),
                    description: description.to_string(),
                    unit: unit.to_string(),
                    kind: InstrumentKind::Counter,
                },
                start_time,
                series: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.inner.descriptor
    }

    /// Adds `value` to the series for `labels`.
    pub fn add(&self, value: u64, labels: &Labels) {
        let mut series = lock(&self.inner.series);
        let slot = series.entry(labels.clone()).or_insert(0);
        let before = *slot;
        *slot = slot.saturating_add(value);
        debug_assert_monotonic!(before, *slot);
    }

    /// Adds one.
    pub fn inc(&self, labels: &Labels) {
        self.add(1, labels);
    }

    /// Current cumulative value for `labels` (zero if never incremented).
    pub fn value(&self, labels: &Labels) -> u64 {
        lock(&self.inner.series).get(labels).copied().unwrap_or(0)
    }

    /// Sum across every label set.
    pub fn total(&self) -> u64 {
        lock(&self.inner.series).values().sum()
    }

    pub(crate) fn collect(&self, timestamp: u64) -> Vec<MetricPoint> {
        let series = lock(&self.inner.series);
        let mut points: Vec<MetricPoint> = series
            .iter()
            .map(|(labels, value)| MetricPoint {
                descriptor: self.inner.descriptor.clone(),
                labels: labels.clone(),
                start_time: self.inner.start_time,
                timestamp,
                value: PointValue::Sum(*value),
            })
            .collect();
        points.sort_by(|a, b| a.labels.cmp(&b.labels));
        points
    }
}

// =============================================================================
// HISTOGRAM
// =============================================================================

/// Records non-negative observations into explicit buckets per label set.
#[derive(Debug, Clone)]
pub struct Histogram {
    inner: Arc<HistogramInner>,
}

#[derive(Debug)]
struct HistogramInner {
    descriptor: Descriptor,
    start_time: u64,
    bounds: Vec<f64>,
    series: Mutex<HashMap<Labels, HistogramState>>,
}

#[derive(Debug, Clone)]
struct HistogramState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    bucket_counts: Vec<u64>,
}

impl HistogramState {
    fn new(buckets: usize) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            bucket_counts: vec![0; buckets],
        }
    }
}

impl Histogram {
    pub(crate) fn new(
        name: &str,
        description: &str,
        unit: &str,
        start_time: u64,
        bounds: Option<Vec<f64>>,
    ) -> Self {
        let mut bounds = bounds.unwrap_or_else(|| DEFAULT_HISTOGRAM_BOUNDS.to_vec());
        bounds.retain(|b| b.is_finite());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        Self {
            inner: Arc::new(HistogramInner {
                descriptor: Descriptor {
                    name: name.to_string(),
                    description: description.to_string(),
                    unit: unit.to_string(),
                    kind: InstrumentKind::Histogram,
                },
                start_time,
                bounds,
                series: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.inner.descriptor
    }

    /// Records one observation. Negative or non-finite values are ignored.
    pub fn record(&self, value: f64, labels: &Labels) {
        if !value.is_finite() || value < 0.0 {
            tracing::debug!(
                instrument = %self.inner.descriptor.name,
                value,
                "ignoring invalid histogram observation"
            );
            return;
        }
        // Bucket i covers (bounds[i-1], bounds[i]]; the last slot is overflow.
        let bucket = self.inner.bounds.partition_point(|b| *b < value);
        let mut series = lock(&self.inner.series);
        let state = series
            .entry(labels.clone())
            .or_insert_with(|| HistogramState::new(self.inner.bounds.len() + 1));
        state.count += 1;
        state.sum += value;
        state.min = state.min.min(value);
        state.max = state.max.max(value);
        state.bucket_counts[bucket] += 1;
    }

    /// Current snapshot for `labels`, if anything was recorded.
    pub fn snapshot(&self, labels: &Labels) -> Option<HistogramSnapshot> {
        lock(&self.inner.series)
            .get(labels)
            .map(|state| self.to_snapshot(state))
    }

    fn to_snapshot(&self, state: &HistogramState) -> HistogramSnapshot {
        HistogramSnapshot {
            count: state.count,
            sum: state.sum,
            min: state.min,
            max: state.max,
            bounds: self.inner.bounds.clone(),
            bucket_counts: state.bucket_counts.clone(),
        }
    }

    pub(crate) fn collect(&self, timestamp: u64) -> Vec<MetricPoint> {
        let series = lock(&self.inner.series);
        let mut points: Vec<MetricPoint> = series
            .iter()
            .map(|(labels, state)| MetricPoint {
                descriptor: self.inner.descriptor.clone(),
                labels: labels.clone(),
                start_time: self.inner.start_time,
                timestamp,
                value: PointValue::Histogram(self.to_snapshot(state)),
            })
            .collect();
        points.sort_by(|a, b| a.labels.cmp(&b.labels));
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(r: &str) -> Labels {
        Labels::new([("method", "GET"), ("route", r)])
    }

    #[test]
    fn test_labels_are_sorted_and_deduplicated() {
        let labels = Labels::new([("route", "/a"), ("method", "GET"), ("route", "/b")]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("route"), Some("/b"));
        assert_eq!(labels.to_string(), "{method=GET,route=/b}");
        assert_eq!(
            Labels::new([("b", "1"), ("a", "2")]),
            Labels::new([("a", "2"), ("b", "1")])
        );
    }

    #[test]
    fn test_counter_accumulates_per_label_set() {
        let counter = Counter::new("requests", "", "1", 0);
        counter.inc(&route("/"));
        counter.inc(&route("/"));
        counter.add(5, &route("/db"));

        assert_eq!(counter.value(&route("/")), 2);
        assert_eq!(counter.value(&route("/db")), 5);
        assert_eq!(counter.value(&route("/missing")), 0);
        assert_eq!(counter.total(), 7);

        let points = counter.collect(42);
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.timestamp == 42));
    }

    #[test]
    fn test_counter_is_cumulative_across_collections() {
        let counter = Counter::new("orders", "", "1", 0);
        counter.inc(&Labels::empty());
        let first = counter.collect(1);
        counter.inc(&Labels::empty());
        let second = counter.collect(2);
        assert_eq!(first[0].value, PointValue::Sum(1));
        assert_eq!(second[0].value, PointValue::Sum(2));
    }

    #[test]
    fn test_histogram_buckets_and_summary() {
        let hist = Histogram::new("latency", "", "ms", 0, Some(vec![10.0, 100.0]));
        let labels = route("/");
        for v in [1.0, 10.0, 50.0, 500.0] {
            hist.record(v, &labels);
        }
        let snap = hist.snapshot(&labels).unwrap();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.sum, 561.0);
        assert_eq!(snap.min, 1.0);
        assert_eq!(snap.max, 500.0);
        // (-inf,10], (10,100], (100,+inf)
        assert_eq!(snap.bucket_counts, vec![2, 1, 1]);
    }

    #[test]
    fn test_histogram_ignores_invalid_observations() {
        let hist = Histogram::new("latency", "", "ms", 0, None);
        let labels = Labels::empty();
        hist.record(-1.0, &labels);
        hist.record(f64::NAN, &labels);
        assert!(hist.snapshot(&labels).is_none());

        hist.record(0.0, &labels);
        let snap = hist.snapshot(&labels).unwrap();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.bucket_counts.len(), DEFAULT_HISTOGRAM_BOUNDS.len() + 1);
    }
}
