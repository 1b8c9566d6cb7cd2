//! `POST <endpoint>` exporter shipping OTLP/JSON bodies to a collector.

use crate::error::ConfigError;
use crate::exporter::{Batch, ExportError, Exporter};
use crate::otlp::OtlpSignal;
use std::marker::PhantomData;
use std::time::Duration;

/// Ships batches of one signal kind to a single collector endpoint.
///
/// Plaintext (`http://`) and TLS (`https://`, rustls) endpoints are both
/// supported; which one is allowed is decided by configuration validation.
pub struct HttpExporter<T> {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    _signal: PhantomData<fn() -> T>,
}

impl<T: OtlpSignal> HttpExporter<T> {
    /// Creates an exporter for `endpoint` whose requests give up after `timeout`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            signal: T::SIGNAL,
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
            _signal: PhantomData,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl<T: OtlpSignal> Exporter<T> for HttpExporter<T> {
    async fn export(&self, batch: Batch<T>) -> Result<(), ExportError> {
        let body = serde_json::to_vec(&T::encode(&batch))
            .map_err(|e| ExportError::Serialization(e.to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExportError::Timeout(self.timeout)
                } else {
                    ExportError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        T::SIGNAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    #[test]
    fn test_rejects_unparsable_endpoint() {
        let err = HttpExporter::<Span>::new("not a url", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidEndpoint { signal: "traces", .. }));
    }

    #[test]
    fn test_keeps_endpoint() {
        let exporter =
            HttpExporter::<Span>::new("http://localhost:4318/v1/traces", Duration::from_secs(1))
                .unwrap();
        assert_eq!(exporter.endpoint(), "http://localhost:4318/v1/traces");
    }
}
