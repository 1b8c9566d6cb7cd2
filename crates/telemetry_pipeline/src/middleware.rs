//! Request instrumentation wrapped around every routed call.
//!
//! Per request: a server root span named after the route, one increment of the
//! request counter and one latency observation, both labelled
//! `{method, route}`. These happen on every exit path: normal return, handler
//! error, handler panic, and the request future being dropped mid-flight.

use crate::instrument::{Counter, Histogram, Labels};
use crate::router::{HandlerError, RequestContext, Response, Router};
use crate::span::{SpanKind, SpanStatus};
use crate::telemetry::Telemetry;
use crate::tracer::{ActiveSpan, Context};
use futures::FutureExt;
use http::{Method, StatusCode};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::time::Instant;

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Body of every 500 produced from a handler fault.
pub const FAULT_MESSAGE: &str = "Error route triggered, check OTEL logs.";

pub const REQUESTS_COUNTER: &str = "http.server.requests";
pub const DURATION_HISTOGRAM: &str = "http.server.duration";

/// A [`Router`] whose every dispatch is instrumented.
pub struct InstrumentedRouter {
    router: Router,
    telemetry: Telemetry,
    requests: Counter,
    latency: Histogram,
}

impl InstrumentedRouter {
    pub fn new(router: Router, telemetry: Telemetry) -> Self {
        let meter = telemetry.meter();
        let requests = meter.counter(REQUESTS_COUNTER, "Inbound requests handled", "1");
        let latency = meter.histogram(DURATION_HISTOGRAM, "Request handling time", "ms");
        Self {
            router,
            telemetry,
            requests,
            latency,
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Dispatches one request and produces its response.
    ///
    /// Handler faults become a 500 with [`FAULT_MESSAGE`], an error log
    /// correlated with the root span, and an error span status. Nothing from
    /// the pipeline itself can fail the request.
    pub async fn handle(&self, method: Method, path: &str) -> Response {
        let matched = self.router.lookup(&method, path);
        let route = matched.as_ref().map_or(UNMATCHED_ROUTE, |r| r.pattern);

        let mut span = self.telemetry.tracer().start_span_with_kind(
            &Context::root(),
            route,
            SpanKind::Server,
        );
        span.set_attribute("http.method", method.as_str());
        span.set_attribute("http.route", route);
        let cx = span.context();

        let mut scope = RequestScope {
            started: Instant::now(),
            labels: Labels::new([("method", method.as_str()), ("route", route)]),
            span: Some(span),
            status: None,
            requests: &self.requests,
            latency: &self.latency,
        };

        let Some(matched) = matched else {
            let response = Response::not_found();
            scope.complete(response.status);
            return response;
        };

        let req = RequestContext::new(method, path, matched.pattern, cx, self.telemetry.clone());
        let outcome = AssertUnwindSafe(matched.handler.handle_boxed(&req))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))));

        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                self.telemetry
                    .logger()
                    .error(&cx, format!("An error occurred: {}", error));
                scope.record_error(&error);
                Response::with_status(StatusCode::INTERNAL_SERVER_ERROR, FAULT_MESSAGE)
            }
        };
        scope.complete(response.status);
        response
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Records request metrics and ends the root span when dropped.
struct RequestScope<'a> {
    started: Instant,
    labels: Labels,
    span: Option<ActiveSpan>,
    /// `None` until a response exists; still `None` on drop means cancelled.
    status: Option<StatusCode>,
    requests: &'a Counter,
    latency: &'a Histogram,
}

impl RequestScope<'_> {
    fn record_error(&mut self, error: &HandlerError) {
        if let Some(span) = self.span.as_mut() {
            span.record_error(error);
        }
    }

    fn complete(&mut self, status: StatusCode) {
        self.status = Some(status);
    }
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.requests.inc(&self.labels);
        self.latency.record(elapsed_ms, &self.labels);

        if let Some(mut span) = self.span.take() {
            match self.status {
                Some(status) => {
                    span.set_attribute("http.status_code", i64::from(status.as_u16()));
                    if status.is_server_error() {
                        span.set_status(SpanStatus::Error);
                    }
                }
                None => span.set_attribute("http.cancelled", true),
            }
            span.end();
        }
    }
}
