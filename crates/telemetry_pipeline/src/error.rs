//! Error types for pipeline setup and teardown.
//!
//! Export failures live in [`crate::exporter::ExportError`] and handler faults in
//! [`crate::router::HandlerError`]; neither ever reaches request callers.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup misconfiguration. Always fatal: the process must not serve requests.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required resource attribute is missing or blank.
    #[error("missing resource attribute: {0}")]
    MissingAttribute(String),

    /// An export endpoint is not an absolute http(s) URL.
    #[error("invalid {signal} endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        signal: &'static str,
        endpoint: String,
        reason: String,
    },

    /// Batch sizing or timing values that cannot work together.
    #[error("invalid batch settings: {0}")]
    InvalidBatch(String),

    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`crate::config::PipelineConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The HTTP client backing an exporter could not be built.
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Failures while draining a processor or collector at shutdown.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShutdownError {
    /// The final flush did not finish within the grace period.
    #[error("{signal} worker did not finish within {grace:?}")]
    Timeout {
        signal: &'static str,
        grace: Duration,
    },

    /// The background worker panicked or was aborted.
    #[error("{signal} worker failed: {reason}")]
    Worker {
        signal: &'static str,
        reason: String,
    },

    /// `shutdown()` was already called.
    #[error("{0} pipeline already shut down")]
    AlreadyShutDown(&'static str),
}
