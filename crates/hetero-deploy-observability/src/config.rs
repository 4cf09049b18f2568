//! Logging configuration and subscriber initialization.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the process-wide `tracing` subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive applied when `RUST_LOG` is unset.
    pub default_directive: String,
    /// Emit JSON-formatted log lines instead of the human-readable
    /// default (useful when shipping logs to a collector).
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber built from this config.
    /// Returns an error rather than panicking if one is already
    /// installed, so callers (tests, multiple binaries in one process)
    /// can call this defensively.
    pub fn init(&self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directive.clone()));

        let registry = tracing_subscriber::registry().with(filter);
        let result = if self.json {
            registry.with(fmt::layer().json()).try_init()
        } else {
            registry.with(fmt::layer()).try_init()
        };
        result.map_err(|e| Error::Tracing(e.to_string()))
    }
}
