//! # Instrumented Demo Server
//!
//! Serves the sample routes over HTTP, with every request passing through the
//! instrumentation middleware. Spans, logs and metrics go to the collector
//! named in the configuration (or stdout with `exporter = "stdout"`).
//!
//! ## Running
//!
//! ```bash
//! # Defaults: http://opentelemetry-collector-svc:4318, listening on 0.0.0.0:5000
//! cargo run -p telemetry_pipeline --bin demo
//!
//! # With a config file and a local collector
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4318 \
//!     cargo run -p telemetry_pipeline --bin demo -- --config pipeline.toml
//!
//! curl localhost:5000/db
//! curl localhost:5000/error
//! ```
//!
//! Ctrl-C stops accepting connections, then drains and flushes all three
//! signals before exiting.

use anyhow::Context as _;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_pipeline::{handlers, InstrumentedRouter, PipelineConfig, Telemetry};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_diagnostics() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn config_path() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

async fn dispatch(
    State(app): State<Arc<InstrumentedRouter>>,
    method: Method,
    uri: Uri,
) -> (StatusCode, String) {
    let response = app.handle(method, uri.path()).await;
    (response.status, response.body)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        // Without a signal handler the server runs until killed.
        tracing::error!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_diagnostics();

    let config = PipelineConfig::load(config_path().as_deref()).context("invalid configuration")?;
    let telemetry = Telemetry::from_config(&config).context("telemetry initialization failed")?;

    let app = Arc::new(InstrumentedRouter::new(
        handlers::routes(&telemetry),
        telemetry.clone(),
    ));
    let server = axum::Router::new().fallback(dispatch).with_state(app);

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "serving");

    axum::serve(listener, server)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    telemetry.shutdown().await?;
    Ok(())
}
