//! Transport-level errors: everything `hetero_deploy::error::Error`
//! cannot express because it has no notion of gRPC, plus a pass-through
//! variant for core errors returned by a remote peer.

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the gRPC control plane or the
/// chunked file transport.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// gRPC channel/connection error.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// gRPC status returned by a peer.
    #[error("gRPC status error: {0}")]
    Status(Box<tonic::Status>),

    /// Envelope payload failed to encode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Envelope payload failed to decode.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Call timed out client-side.
    #[error("transport call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Endpoint string or channel setup was invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Health check returned not-serving.
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    /// Retry budget exhausted without a successful call.
    #[error("retry exhausted after {0} attempts")]
    RetryExhausted(usize),

    /// A file chunk arrived with a checksum mismatch or out-of-session
    /// `relative_path`.
    #[error("file transfer integrity error: {0}")]
    FileIntegrity(String),

    /// A peer reported a core-domain failure (`hetero_deploy::Error`),
    /// forwarded across the wire as a `StatusResponse`.
    #[error("remote error: {0}")]
    Remote(#[from] hetero_deploy::Error),

    /// Local filesystem failure during chunked file transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same call is likely to help: transient
    /// transport/status codes and client-side timeouts, never
    /// serialization or remote domain errors.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout(_) => true,
            Error::Status(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::Aborted
            ),
            Error::Remote(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Status(Box::new(status))
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Status(status) => *status,
            Error::Remote(ref core) if core.is_retryable() => tonic::Status::unavailable(err.to_string()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_error_display() {
        let err = Error::Serialization("bad payload".to_string());
        assert_eq!(err.to_string(), "serialization error: bad payload");
    }

    #[test]
    fn timeout_is_retryable() {
        assert!(Error::Timeout(std::time::Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn status_unavailable_is_retryable() {
        let err = Error::from(tonic::Status::unavailable("down"));
        assert!(err.is_retryable());
    }

    #[test]
    fn status_invalid_argument_is_not_retryable() {
        let err = Error::from(tonic::Status::invalid_argument("bad"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn remote_error_retryability_follows_core_classification() {
        let err = Error::Remote(hetero_deploy::Error::Timeout(std::time::Duration::from_secs(1)));
        assert!(err.is_retryable());
        let err = Error::Remote(hetero_deploy::Error::ParamInvalid("x".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn file_integrity_error_display() {
        let err = Error::FileIntegrity("checksum mismatch".to_string());
        assert_eq!(err.to_string(), "file transfer integrity error: checksum mismatch");
    }
}
