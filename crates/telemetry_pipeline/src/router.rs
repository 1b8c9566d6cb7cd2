//! Explicit route table mapping `(method, path)` to a handler.
//!
//! Handlers return `Result<Response, HandlerError>`; turning an error into a
//! 500 (and the telemetry that goes with it) is the middleware's job.

use crate::telemetry::Telemetry;
use crate::tracer::Context;
use http::{Method, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Fault raised by a handler. Never shown to the client verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Integer division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// A downstream dependency (payment provider, database, ...) failed.
    #[error("{dependency} failed: {reason}")]
    Dependency {
        dependency: &'static str,
        reason: String,
    },

    /// The handler panicked; the payload text if it was a string.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Checked integer division, the arithmetic fault surfaced as a value.
pub fn checked_div(numerator: i64, denominator: i64) -> Result<i64, HandlerError> {
    numerator
        .checked_div(denominator)
        .ok_or(HandlerError::DivisionByZero)
}

/// Response produced by a handler or by the middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub body: String,
}

impl Response {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::with_status(StatusCode::OK, body)
    }

    pub fn with_status(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::with_status(StatusCode::NOT_FOUND, "Not Found")
    }
}

/// Per-request state handed to a handler.
///
/// Lives from the start of the request until its response is produced.
#[derive(Clone)]
pub struct RequestContext {
    method: Method,
    path: String,
    route: &'static str,
    cx: Context,
    telemetry: Telemetry,
}

impl RequestContext {
    pub(crate) fn new(
        method: Method,
        path: impl Into<String>,
        route: &'static str,
        cx: Context,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            route,
            cx,
            telemetry,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The matched route pattern.
    pub fn route(&self) -> &'static str {
        self.route
    }

    /// Context with the request's root span active.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }
}

/// A request handler.
///
/// Uses native async fn in traits; see [`HandlerBoxed`] for dynamic dispatch.
pub trait Handler: Send + Sync {
    fn handle(
        &self,
        req: &RequestContext,
    ) -> impl Future<Output = Result<Response, HandlerError>> + Send;
}

/// Object-safe version of [`Handler`] stored in the route table.
pub trait HandlerBoxed: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        req: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send + 'a>>;
}

impl<H: Handler> HandlerBoxed for H {
    fn handle_boxed<'a>(
        &'a self,
        req: &'a RequestContext,
    ) -> Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send + 'a>> {
        Box::pin(self.handle(req))
    }
}

/// A matched route: its static pattern and handler.
#[derive(Clone)]
pub struct Route {
    pub pattern: &'static str,
    pub handler: Arc<dyn HandlerBoxed>,
}

/// Exact-match route table.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<Method, HashMap<&'static str, Arc<dyn HandlerBoxed>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method path`, replacing any previous one.
    pub fn route(
        mut self,
        method: Method,
        path: &'static str,
        handler: impl Handler + 'static,
    ) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, Arc::new(handler));
        self
    }

    pub fn get(self, path: &'static str, handler: impl Handler + 'static) -> Self {
        self.route(Method::GET, path, handler)
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Option<Route> {
        let (pattern, handler) = self.routes.get(method)?.get_key_value(path)?;
        Some(Route {
            pattern: *pattern,
            handler: Arc::clone(handler),
        })
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
