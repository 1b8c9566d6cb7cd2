//! Startup configuration: TOML file, then environment overrides, then validation.
//!
//! ```toml
//! exporter = "otlp"
//! transport = "plaintext"
//!
//! [service]
//! name = "flask-app"
//! environment = "staging"
//!
//! [endpoints]
//! base = "http://opentelemetry-collector-svc:4318"
//!
//! [traces]
//! max_queue_size = 2048
//! max_export_batch_size = 512
//! scheduled_delay_ms = 5000
//! ```

use crate::batch_processor::BatchConfig;
use crate::error::ConfigError;
use crate::instrument::MetricPoint;
use crate::log_record::LogRecord;
use crate::metric_collector::MetricsConfig;
use crate::otlp::OtlpSignal;
use crate::resource::Resource;
use crate::span::{AttributeValue, Span};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_COLLECTOR: &str = "http://opentelemetry-collector-svc:4318";
pub const DEFAULT_SERVICE_NAME: &str = "flask-app";
pub const DEFAULT_BIND: &str = "0.0.0.0:5000";

pub const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
pub const ENV_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const ENV_TRACES_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_TRACES_ENDPOINT";
pub const ENV_LOGS_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_LOGS_ENDPOINT";
pub const ENV_METRICS_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_METRICS_ENDPOINT";
pub const ENV_ENVIRONMENT: &str = "DEPLOYMENT_ENVIRONMENT";

/// Where batches go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    /// OTLP/JSON over HTTP to the configured endpoints
    #[default]
    Otlp,
    /// Pretty-print to stdout
    Stdout,
    /// Discard everything
    None,
}

/// Transport the collector endpoints must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Plaintext,
    Tls,
}

impl Transport {
    fn scheme(self) -> &'static str {
        match self {
            Self::Plaintext => "http",
            Self::Tls => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub environment: Option<String>,
    /// Extra free-form resource attributes
    pub attributes: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVICE_NAME.to_string(),
            environment: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// Collector base URL plus optional per-signal overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub base: String,
    pub traces: Option<String>,
    pub logs: Option<String>,
    pub metrics: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_COLLECTOR.to_string(),
            traces: None,
            logs: None,
            metrics: None,
        }
    }
}

impl EndpointConfig {
    fn resolve<T: OtlpSignal>(&self, explicit: Option<&String>) -> String {
        match explicit {
            Some(url) => url.clone(),
            None => format!("{}{}", self.base.trim_end_matches('/'), T::PATH),
        }
    }

    pub fn traces_url(&self) -> String {
        self.resolve::<Span>(self.traces.as_ref())
    }

    pub fn logs_url(&self) -> String {
        self.resolve::<LogRecord>(self.logs.as_ref())
    }

    pub fn metrics_url(&self) -> String {
        self.resolve::<MetricPoint>(self.metrics.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub exporter: ExporterKind,
    pub transport: Transport,
    pub service: ServiceConfig,
    pub endpoints: EndpointConfig,
    pub traces: BatchConfig,
    pub logs: BatchConfig,
    pub metrics: MetricsConfig,
    pub server: ServerConfig,
}

impl PipelineConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// File (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies the `OTEL_*` overrides found by `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(name) = get(ENV_SERVICE_NAME) {
            self.service.name = name;
        }
        if let Some(environment) = get(ENV_ENVIRONMENT) {
            self.service.environment = Some(environment);
        }
        if let Some(base) = get(ENV_ENDPOINT) {
            self.endpoints.base = base;
        }
        if let Some(url) = get(ENV_TRACES_ENDPOINT) {
            self.endpoints.traces = Some(url);
        }
        if let Some(url) = get(ENV_LOGS_ENDPOINT) {
            self.endpoints.logs = Some(url);
        }
        if let Some(url) = get(ENV_METRICS_ENDPOINT) {
            self.endpoints.metrics = Some(url);
        }
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service.name = name.into();
        self
    }

    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_collector(mut self, base: impl Into<String>) -> Self {
        self.endpoints.base = base.into();
        self
    }

    pub fn with_traces(mut self, config: BatchConfig) -> Self {
        self.traces = config;
        self
    }

    pub fn with_logs(mut self, config: BatchConfig) -> Self {
        self.logs = config;
        self
    }

    pub fn with_metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    /// Builds the process resource from the service section.
    pub fn resource(&self) -> Result<Resource, ConfigError> {
        let mut builder = Resource::builder(self.service.name.clone());
        if let Some(environment) = &self.service.environment {
            builder = builder.with_environment(environment.clone());
        }
        for (key, value) in &self.service.attributes {
            builder = builder.with_attribute(key.clone(), AttributeValue::String(value.clone()));
        }
        builder.build()
    }

    /// Rejects anything the pipeline cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resource()?;
        self.traces.validate()?;
        self.logs.validate()?;
        self.metrics.validate()?;

        if self.exporter == ExporterKind::Otlp {
            self.check_endpoint("traces", &self.endpoints.traces_url())?;
            self.check_endpoint("logs", &self.endpoints.logs_url())?;
            self.check_endpoint("metrics", &self.endpoints.metrics_url())?;
        }
        Ok(())
    }

    fn check_endpoint(&self, signal: &'static str, endpoint: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEndpoint {
            signal,
            endpoint: endpoint.to_string(),
            reason,
        };
        let url = url::Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        let expected = self.transport.scheme();
        if url.scheme() != expected {
            return Err(invalid(format!(
                "{:?} transport requires {}://, got {}://",
                self.transport,
                expected,
                url.scheme()
            )));
        }
        Ok(())
    }
}
