//! Client error types.

use iotdm_protocol::{GatewayError, Protocol};
use thiserror::Error;

/// Errors from transport clients and the client pool.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] iotdm_protocol::ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("broker refused connection (return code {0})")]
    BrokerRefused(u8),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("unsupported security mode: {0}")]
    UnsupportedSecurity(String),

    #[error("{protocol} client disabled: {reason}")]
    Disabled { protocol: Protocol, reason: String },

    #[error("client pool is shut down")]
    ShutDown,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }
}

impl From<hyper::Error> for ClientError {
    fn from(err: hyper::Error) -> Self {
        ClientError::Http(err.to_string())
    }
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        GatewayError::TransportSendFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_send_failure() {
        let err: GatewayError = ClientError::Timeout.into();
        assert!(matches!(err, GatewayError::TransportSendFailure(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::ShutDown.is_retryable());
        assert!(!ClientError::UnsupportedSecurity("DTLS".into()).is_retryable());
    }
}
