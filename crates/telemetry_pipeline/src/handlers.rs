//! Sample routes standing in for request-scoped work.
//!
//! Each one exercises a different part of the pipeline: plain logging, nested
//! spans, arithmetic faults, named business metrics and a coin-flip payment
//! dependency.

use crate::instrument::{Counter, Histogram, Labels};
use crate::metric_collector::Meter;
use crate::router::{checked_div, Handler, HandlerError, RequestContext, Response, Router};
use crate::telemetry::Telemetry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const GREETING: &str = "Hello from Flask + OpenTelemetry! (Traces + Logs)";

pub const ORDERS_COUNTER: &str = "orders_total";
pub const CHECKOUT_HISTOGRAM: &str = "checkout_amount";
pub const PURCHASES_COUNTER: &str = "purchases_total";
pub const PAYMENT_FAILURES_COUNTER: &str = "payment_failures_total";

const QUERY_LATENCY: Duration = Duration::from_millis(20);
const UPDATE_LATENCY: Duration = Duration::from_millis(10);

/// The sample route table with a random payment outcome source.
pub fn routes(telemetry: &Telemetry) -> Router {
    routes_with_seed(telemetry, rand::random())
}

/// Same as [`routes`], with a reproducible payment outcome sequence.
pub fn routes_with_seed(telemetry: &Telemetry, seed: u64) -> Router {
    let shop = Arc::new(Shop::new(telemetry.meter(), seed));
    Router::new()
        .get("/", Index)
        .get("/compute", Compute)
        .get("/db", Database)
        .get("/error", DivideByZero)
        .get("/order", Order(Arc::clone(&shop)))
        .get("/checkout", Checkout(Arc::clone(&shop)))
        .get("/buy", Buy(Arc::clone(&shop)))
        .get("/pay", Pay(shop))
}

/// Instruments and randomness shared by the shop routes.
struct Shop {
    orders: Counter,
    checkout_amount: Histogram,
    purchases: Counter,
    payment_failures: Counter,
    rng: Mutex<StdRng>,
}

impl Shop {
    fn new(meter: &Meter, seed: u64) -> Self {
        Self {
            orders: meter.counter(ORDERS_COUNTER, "Orders placed", "1"),
            checkout_amount: meter.histogram(CHECKOUT_HISTOGRAM, "Checkout cart value", "USD"),
            purchases: meter.counter(PURCHASES_COUNTER, "Items bought", "1"),
            payment_failures: meter.counter(
                PAYMENT_FAILURES_COUNTER,
                "Payments declined by the gateway",
                "1",
            ),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn web() -> Labels {
    Labels::new([("channel", "web")])
}

struct Index;

impl Handler for Index {
    async fn handle(&self, req: &RequestContext) -> Result<Response, HandlerError> {
        req.telemetry()
            .logger()
            .info(req.context(), "Received request at / endpoint");
        Ok(Response::ok(GREETING))
    }
}

/// Sum of squares of `1..=n`.
fn sum_of_squares(n: u64) -> u64 {
    (1..=n).map(|i| i * i).sum()
}

struct Compute;

impl Handler for Compute {
    async fn handle(&self, req: &RequestContext) -> Result<Response, HandlerError> {
        let logger = req.telemetry().logger();
        logger.info(req.context(), "Starting computation");
        let result = sum_of_squares(100);
        logger.info(req.context(), format!("Computation result: {}", result));
        Ok(Response::ok(format!("Computed result: {}", result)))
    }
}

struct Database;

impl Handler for Database {
    async fn handle(&self, req: &RequestContext) -> Result<Response, HandlerError> {
        let tracer = req.telemetry().tracer();
        let logger = req.telemetry().logger();
        logger.info(req.context(), "Starting database operation");

        let rows = tracer
            .in_span(req.context(), "query", |cx| async move {
                tokio::time::sleep(QUERY_LATENCY).await;
                logger.info(&cx, "Query returned 3 rows");
                Ok::<_, HandlerError>(3)
            })
            .await?;

        tracer
            .in_span(req.context(), "update", |cx| async move {
                tokio::time::sleep(UPDATE_LATENCY).await;
                logger.info(&cx, format!("Updated {} rows", rows));
                Ok::<_, HandlerError>(())
            })
            .await?;

        Ok(Response::ok("Database operation completed"))
    }
}

struct DivideByZero;

impl Handler for DivideByZero {
    async fn handle(&self, _req: &RequestContext) -> Result<Response, HandlerError> {
        let quotient = checked_div(1, 0)?;
        Ok(Response::ok(quotient.to_string()))
    }
}

struct Order(Arc<Shop>);

impl Handler for Order {
    async fn handle(&self, req: &RequestContext) -> Result<Response, HandlerError> {
        self.0.orders.inc(&web());
        req.telemetry().logger().info(req.context(), "Order placed");
        Ok(Response::ok("Order placed"))
    }
}

struct Checkout(Arc<Shop>);

impl Handler for Checkout {
    async fn handle(&self, req: &RequestContext) -> Result<Response, HandlerError> {
        let amount: f64 = self.0.rng().gen_range(10.0..500.0);
        self.0.checkout_amount.record(amount, &web());
        req.telemetry()
            .logger()
            .info(req.context(), format!("Checkout completed: {:.2}", amount));
        Ok(Response::ok(format!("Checkout total: {:.2}", amount)))
    }
}

struct Buy(Arc<Shop>);

impl Handler for Buy {
    async fn handle(&self, req: &RequestContext) -> Result<Response, HandlerError> {
        let quantity: u64 = self.0.rng().gen_range(1..=5);
        self.0.purchases.add(quantity, &web());
        req.telemetry()
            .logger()
            .info(req.context(), format!("Bought {} items", quantity));
        Ok(Response::ok(format!("Bought {} items", quantity)))
    }
}

struct Pay(Arc<Shop>);

impl Handler for Pay {
    async fn handle(&self, req: &RequestContext) -> Result<Response, HandlerError> {
        let declined = self.0.rng().gen_bool(0.5);
        if declined {
            self.0
                .payment_failures
                .inc(&Labels::new([("reason", "declined")]));
            return Err(HandlerError::Dependency {
                dependency: "payment gateway",
                reason: "card declined".to_string(),
            });
        }
        req.telemetry()
            .logger()
            .info(req.context(), "Payment processed");
        Ok(Response::ok("Payment processed"))
    }
}
