//! Error types for the metrics and tracing glue.

use thiserror::Error;

/// Error type for observability operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// A Prometheus metric failed to register or collect.
    #[error("metrics operation failed: {0}")]
    Metrics(String),

    /// The tracing subscriber could not be installed (usually because
    /// one was already installed for this process).
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),

    /// Generic passthrough for I/O and other setup failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

/// Result type for observability operations.
pub type Result<T> = std::result::Result<T, Error>;
