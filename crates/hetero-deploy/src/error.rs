//! Crate-wide error type.
//!
//! Every fallible operation in `hetero-deploy` returns this [`Error`] (or a
//! `Result` alias over it). Variants map onto the error taxonomy described
//! for the deployment/exchange/executor-supervision core: configuration
//! errors are never retried, transport/timeout errors are, and deployment
//! failures carry enough context for the orchestrator to run its
//! compensating undeploy.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the deployment planner, exchange route engine,
/// subprocess manager, executor supervision, and runtime executor handle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A plan, request, or configuration value failed validation.
    /// Never retried; the caller passed something malformed.
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    /// A requested operation or process type is not supported by this
    /// build or configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A queue, tag, or gateway operation timed out.
    #[error("transport timeout after {0:?}")]
    Timeout(Duration),

    /// The transport layer reported a non-timeout failure (connection
    /// refused, stream reset, serialization mismatch).
    #[error("transport error: {0}")]
    Transport(String),

    /// One step of `HeterogeneousModelDeployer`'s orchestration failed.
    /// The orchestrator is responsible for compensating undeploy on the
    /// node set that reached "loaded".
    #[error("deploy failed at step {step}: {reason}")]
    DeployFailed {
        /// Name of the orchestration step that failed.
        step: &'static str,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An executor subprocess died or could not be reached; the caller
    /// should treat in-flight feed/fetch calls as failed.
    #[error("executor {0} is unreachable: {1}")]
    ExecutorUnreachable(String, String),

    /// A redeploy is already in flight; the abnormal status handler
    /// refuses to start a second one for the same root model.
    #[error("redeploy already in progress for model {0}")]
    RedeployInProgress(String),

    /// The model is in a subhealthy or redeploying state and cannot
    /// currently serve feed/fetch (`ACL_ERROR_GE_REDEPLOYING` /
    /// `ACL_ERROR_GE_SUBHEALTHY` in the original taxonomy).
    #[error("model is redeploying")]
    Redeploying,

    /// The model is subhealthy (degraded but not being redeployed).
    #[error("model is subhealthy")]
    Subhealthy,

    /// A data-flow exception was reported by an executor for the given
    /// trans-id and scope.
    #[error("data-flow exception on trans_id {trans_id} scope {scope:?}: code {code}")]
    DataFlowException {
        /// Correlating trans-id.
        trans_id: u64,
        /// Exception scope; empty string is the reserved model-IO scope.
        scope: String,
        /// Raw exception code from the executor.
        code: i32,
    },

    /// A pending wait (fetch alignment, data-flow exception) was evicted
    /// from a bounded cache before it could be resolved.
    #[error("trans_id {0} expired from bounded cache")]
    Expired(u64),

    /// Spawning or supervising a subprocess failed.
    #[error("subprocess error: {0}")]
    Subprocess(String),

    /// Filesystem I/O failure (chunk write, sentinel file, resource config).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization of a wire envelope failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether retrying the operation that produced this error is
    /// meaningful. Configuration and deploy-failure errors are never
    /// retryable; transport hiccups and timeouts are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_invalid_is_not_retryable() {
        let e = Error::ParamInvalid("bad replica count".into());
        assert!(!e.is_retryable());
        assert_eq!(e.to_string(), "invalid parameter: bad replica count");
    }

    #[test]
    fn timeout_is_retryable() {
        let e = Error::Timeout(Duration::from_millis(200));
        assert!(e.is_retryable());
    }

    #[test]
    fn transport_is_retryable() {
        let e = Error::Transport("connection reset".into());
        assert!(e.is_retryable());
    }

    #[test]
    fn deploy_failed_is_not_retryable() {
        let e = Error::DeployFailed {
            step: "LoadSubmodels",
            reason: "node-2 unreachable".into(),
        };
        assert!(!e.is_retryable());
        assert!(e.to_string().contains("LoadSubmodels"));
    }

    #[test]
    fn data_flow_exception_display() {
        let e = Error::DataFlowException {
            trans_id: 42,
            scope: String::new(),
            code: -1,
        };
        assert!(e.to_string().contains("trans_id 42"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Error = io_err.into();
        assert!(!e.is_retryable());
        assert!(matches!(e, Error::Io(_)));
    }
}
