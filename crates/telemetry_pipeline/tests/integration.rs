//! End-to-end behaviour of the pipeline through its public API.

use proptest::prelude::*;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::handlers::{self, PAYMENT_FAILURES_COUNTER};
use telemetry_pipeline::middleware::REQUESTS_COUNTER;
use telemetry_pipeline::{
    Batch, BatchConfig, BatchExportProcessor, ExportError, Exporter, InMemoryExporter,
    InstrumentedRouter, Labels, LogRecord, Method, MetricPoint, PointValue, Resource, Severity,
    Span, SpanContext, SpanKind, SpanStatus, StatusCode, Telemetry, FAULT_MESSAGE,
};

// =============================================================================
// HELPERS
// =============================================================================

fn resource() -> Arc<Resource> {
    Arc::new(
        Resource::builder("flask-app")
            .with_environment("test")
            .build()
            .unwrap(),
    )
}

struct TestApp {
    app: InstrumentedRouter,
    spans: Arc<InMemoryExporter<Span>>,
    logs: Arc<InMemoryExporter<LogRecord>>,
    metrics: Arc<InMemoryExporter<MetricPoint>>,
}

impl TestApp {
    fn new(seed: u64) -> Self {
        let spans = Arc::new(InMemoryExporter::new());
        let logs = Arc::new(InMemoryExporter::new());
        let metrics = Arc::new(InMemoryExporter::new());
        let telemetry = Telemetry::builder(Resource::builder("flask-app").build().unwrap())
            .with_traces(BatchConfig::default().with_max_queue_size(8192))
            .with_logs(BatchConfig::default().with_max_queue_size(8192))
            .with_span_exporter(spans.clone())
            .with_log_exporter(logs.clone())
            .with_metric_exporter(metrics.clone())
            .build();
        let app = InstrumentedRouter::new(handlers::routes_with_seed(&telemetry, seed), telemetry);
        Self {
            app,
            spans,
            logs,
            metrics,
        }
    }

    fn telemetry(&self) -> &Telemetry {
        self.app.telemetry()
    }

    fn requests(&self, route: &str) -> u64 {
        self.telemetry()
            .meter()
            .counter(REQUESTS_COUNTER, "", "")
            .value(&Labels::new([("method", "GET"), ("route", route)]))
    }

    async fn shutdown(&self) {
        self.telemetry().shutdown().await.unwrap();
    }
}

/// Counts calls and always fails.
#[derive(Default)]
struct Unreachable {
    calls: AtomicUsize,
}

impl Exporter<Span> for Unreachable {
    fn export(&self, _batch: Batch<Span>) -> impl Future<Output = Result<(), ExportError>> + Send {
        self.calls.fetch_add(1, Ordering::Relaxed);
        async { Err(ExportError::Transport("connection refused".into())) }
    }

    fn name(&self) -> &str {
        "unreachable"
    }
}

fn ids(batches: &[Vec<u64>]) -> Vec<u64> {
    batches.iter().flatten().copied().collect()
}

// =============================================================================
// BATCH EXPORT PROCESSOR
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_export_calls_equal_ceil_n_over_b(n in 0usize..400, b in 1usize..64) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let (calls, exported) = rt.block_on(async move {
            let exporter = Arc::new(InMemoryExporter::<u64>::new());
            let delay = Duration::from_secs(1);
            let config = BatchConfig::default()
                .with_max_queue_size(n.max(b))
                .with_max_export_batch_size(b)
                .with_scheduled_delay(delay);
            let processor = BatchExportProcessor::new("test", config, exporter.clone(), resource());

            for i in 0..n as u64 {
                assert!(processor.enqueue(i));
            }
            tokio::time::sleep(delay * 2 + Duration::from_millis(1)).await;
            (exporter.export_calls(), ids(&exporter.batches()))
        });

        prop_assert_eq!(calls, n.div_ceil(b));
        prop_assert_eq!(exported, (0..n as u64).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_overflow_drops_exactly_the_excess() {
    let exporter = Arc::new(InMemoryExporter::<u64>::new());
    let config = BatchConfig::default()
        .with_max_queue_size(10)
        .with_max_export_batch_size(10);
    let processor = BatchExportProcessor::new("test", config, exporter.clone(), resource());

    let accepted = (0..25u64).filter(|i| processor.enqueue(*i)).count();
    assert_eq!(accepted, 10);
    assert_eq!(processor.metrics().dropped(), 15);

    processor.shutdown().await.unwrap();
    assert_eq!(exporter.records(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_shutdown_exports_everything_in_one_call() {
    let exporter = Arc::new(InMemoryExporter::<u64>::new());
    let config = BatchConfig::default()
        .with_max_queue_size(2048)
        .with_max_export_batch_size(100);
    let processor = BatchExportProcessor::new("test", config, exporter.clone(), resource());

    for i in 0..1000u64 {
        processor.enqueue(i);
    }
    processor.shutdown().await.unwrap();

    assert_eq!(exporter.export_calls(), 1);
    assert_eq!(exporter.records(), (0..1000).collect::<Vec<_>>());
    assert!(!processor.enqueue(1000));
}

#[tokio::test(start_paused = true)]
async fn test_failing_exporter_never_blocks_enqueue() {
    let exporter = Arc::new(Unreachable::default());
    let config = BatchConfig::default()
        .with_max_export_batch_size(5)
        .with_scheduled_delay(Duration::from_millis(100));
    let processor = BatchExportProcessor::<Span>::new("traces", config, exporter.clone(), resource());

    let mut next_id = 1u64;
    for round in 0..3 {
        for _ in 0..5 {
            let ctx = SpanContext {
                trace_id: 1,
                span_id: next_id,
            };
            next_id += 1;
            let mut span = Span::new(ctx, None, "op".into(), SpanKind::Internal, 0);
            span.finish(1);
            assert!(processor.enqueue(span), "round {}", round);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    assert_eq!(exporter.calls.load(Ordering::Relaxed), 3);
    assert_eq!(processor.metrics().export_errors(), 3);
    assert_eq!(processor.metrics().records_exported(), 0);
    processor.shutdown().await.unwrap();
}

// =============================================================================
// REQUEST INSTRUMENTATION
// =============================================================================

#[tokio::test]
async fn test_request_counter_increments_once_per_request() {
    let t = TestApp::new(1);
    for _ in 0..3 {
        assert_eq!(t.app.handle(Method::GET, "/").await.status, StatusCode::OK);
    }
    for _ in 0..2 {
        let response = t.app.handle(Method::GET, "/error").await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    assert_eq!(t.requests("/"), 3);
    assert_eq!(t.requests("/error"), 2);
    assert_eq!(t.requests("/db"), 0);

    t.shutdown().await;
    let points = t.metrics.records();
    let root_count = points
        .iter()
        .find(|p| {
            p.descriptor.name == REQUESTS_COUNTER && p.labels.get("route") == Some("/")
        })
        .map(|p| p.value.clone());
    assert_eq!(root_count, Some(PointValue::Sum(3)));
}

#[tokio::test]
async fn test_index_emits_one_span_and_one_info_log() {
    let t = TestApp::new(1);
    let response = t.app.handle(Method::GET, "/").await;
    assert_eq!(response.body, handlers::GREETING);

    t.shutdown().await;
    let spans = t.spans.records();
    let logs = t.logs.records();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "/");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].severity, Severity::Info);
    assert_eq!(logs[0].span_context(), Some(spans[0].context()));
}

#[tokio::test]
async fn test_compute_is_deterministic_with_two_logs() {
    let t = TestApp::new(1);
    let first = t.app.handle(Method::GET, "/compute").await;
    let second = t.app.handle(Method::GET, "/compute").await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body, second.body);
    assert!(first.body.contains("338350"));

    t.shutdown().await;
    assert_eq!(t.spans.exported_count(), 2);
    assert_eq!(t.logs.exported_count(), 4);
}

#[tokio::test]
async fn test_error_route_returns_500_with_single_correlated_error_log() {
    let t = TestApp::new(1);
    let response = t.app.handle(Method::GET, "/error").await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body, FAULT_MESSAGE);
    assert!(response.body.contains("check OTEL logs"));

    t.shutdown().await;
    let spans = t.spans.records();
    assert_eq!(spans.len(), 1);
    let root = &spans[0];
    assert_eq!(root.name, "/error");
    assert_eq!(root.status, SpanStatus::Error);

    let errors: Vec<LogRecord> = t
        .logs
        .records()
        .into_iter()
        .filter(|l| l.severity == Severity::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].span_context(), Some(root.context()));
    assert!(errors[0].body.contains("division by zero"));
}

#[tokio::test]
async fn test_pay_fails_about_half_the_time() {
    let t = TestApp::new(7);
    let mut failures = 0u64;
    for _ in 0..1000 {
        let response = t.app.handle(Method::GET, "/pay").await;
        match response.status {
            StatusCode::OK => {}
            StatusCode::INTERNAL_SERVER_ERROR => failures += 1,
            other => panic!("unexpected status {}", other),
        }
    }

    assert!((450..=550).contains(&failures), "failures = {}", failures);
    let counted = t
        .telemetry()
        .meter()
        .counter(PAYMENT_FAILURES_COUNTER, "", "")
        .total();
    assert_eq!(counted, failures);
    assert_eq!(t.requests("/pay"), 1000);

    t.shutdown().await;
    let error_logs = t
        .logs
        .records()
        .iter()
        .filter(|l| l.severity == Severity::Error)
        .count() as u64;
    assert_eq!(error_logs, failures);
}

#[tokio::test]
async fn test_shop_routes_record_business_metrics() {
    let t = TestApp::new(3);
    for path in ["/order", "/order", "/checkout", "/buy"] {
        assert_eq!(t.app.handle(Method::GET, path).await.status, StatusCode::OK);
    }
    let meter = t.telemetry().meter();
    let web = Labels::new([("channel", "web")]);
    assert_eq!(meter.counter(handlers::ORDERS_COUNTER, "", "").value(&web), 2);
    let checkout = meter
        .histogram(handlers::CHECKOUT_HISTOGRAM, "", "")
        .snapshot(&web)
        .unwrap();
    assert_eq!(checkout.count, 1);
    assert!((10.0..500.0).contains(&checkout.sum));
    let bought = meter.counter(handlers::PURCHASES_COUNTER, "", "").value(&web);
    assert!((1..=5).contains(&bought));
    t.shutdown().await;
}

// =============================================================================
// SPANS AND LOG CORRELATION
// =============================================================================

#[tokio::test]
async fn test_db_children_nest_under_root() {
    let t = TestApp::new(1);
    assert_eq!(t.app.handle(Method::GET, "/db").await.status, StatusCode::OK);

    t.shutdown().await;
    let spans = t.spans.records();
    assert_eq!(spans.len(), 3);
    let root = spans.iter().find(|s| s.name == "/db").unwrap();
    assert_eq!(root.kind, SpanKind::Server);
    assert_eq!(root.parent_span_id, None);

    for name in ["query", "update"] {
        let child = spans.iter().find(|s| s.name == name).unwrap();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert!(child.end_time.unwrap() >= child.start_time);
        assert!(root.end_time.unwrap() >= child.end_time.unwrap());
    }

    let logs = t.logs.records();
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| l.severity == Severity::Info));
    let query = spans.iter().find(|s| s.name == "query").unwrap();
    assert_eq!(logs[0].span_context(), Some(root.context()));
    assert_eq!(logs[1].span_context(), Some(query.context()));
}

#[tokio::test]
async fn test_log_without_active_span_is_uncorrelated() {
    let t = TestApp::new(1);
    t.telemetry()
        .logger()
        .info(&telemetry_pipeline::Context::root(), "startup complete");
    t.shutdown().await;

    let logs = t.logs.records();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].trace_id, None);
    assert_eq!(logs[0].span_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_share_context() {
    let t = Arc::new(TestApp::new(1));
    let mut tasks = Vec::new();
    for _ in 0..32 {
        let t = Arc::clone(&t);
        tasks.push(tokio::spawn(async move {
            t.app.handle(Method::GET, "/db").await.status
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }
    t.shutdown().await;

    let spans = t.spans.records();
    let logs = t.logs.records();
    assert_eq!(spans.len(), 32 * 3);
    assert_eq!(logs.len(), 32 * 3);

    let traces: HashSet<u128> = spans.iter().map(|s| s.trace_id).collect();
    assert_eq!(traces.len(), 32);
    for trace in &traces {
        let members: Vec<&Span> = spans.iter().filter(|s| s.trace_id == *trace).collect();
        assert_eq!(members.len(), 3);
        let root = members.iter().find(|s| s.parent_span_id.is_none()).unwrap();
        assert!(members
            .iter()
            .filter(|s| s.parent_span_id.is_some())
            .all(|s| s.parent_span_id == Some(root.span_id)));
    }

    // Each log points at a span of its own trace.
    for log in &logs {
        let ctx = log.span_context().unwrap();
        let owner = spans.iter().find(|s| s.span_id == ctx.span_id).unwrap();
        assert_eq!(owner.trace_id, ctx.trace_id);
    }
}
