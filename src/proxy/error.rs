//! Error types for proxy operations.

use thiserror::Error;

/// Unified error type for proxy operations.
///
/// Policy refusals are not errors; they are regular denial responses. This
/// type covers transport and protocol failures plus the internal-invariant
/// class, which is the only one that escalates log severity.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on the listener or a connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The client request could not be interpreted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Unexpected invariant violation; surfaces as 500 and a WARN+ log line.
    #[error("internal proxy error: {0}")]
    Internal(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_request_display() {
        let err = ProxyError::InvalidRequest("missing authority".to_string());
        assert!(err.to_string().contains("missing authority"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }

    #[test]
    fn test_internal_error_has_stable_prefix() {
        let err = ProxyError::Internal("tracker entry vanished".to_string());
        assert!(err.to_string().starts_with("internal proxy error"));
    }
}
