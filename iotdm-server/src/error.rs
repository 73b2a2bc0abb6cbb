//! Server error types.

use crate::registry::RegistrationError;
use iotdm_protocol::{GatewayError, Protocol};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] iotdm_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] iotdm_core::StoreError),

    #[error("client error: {0}")]
    Client(#[from] iotdm_client::ClientError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("{protocol} transport not started: {reason}")]
    TransportDisabled { protocol: Protocol, reason: String },

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl ServerError {
    /// Classifies the error into the gateway taxonomy.
    pub fn to_gateway_error(&self) -> GatewayError {
        match self {
            ServerError::Protocol(e) => GatewayError::BadRequest(e.to_string()),
            ServerError::Json(e) => GatewayError::BadRequest(e.to_string()),
            ServerError::Store(e) => e.clone().into(),
            ServerError::Client(e) => GatewayError::TransportSendFailure(e.to_string()),
            ServerError::TransportDisabled { .. } | ServerError::TlsConfig(_) => {
                GatewayError::Config(self.to_string())
            }
            ServerError::Io(_)
            | ServerError::Registration(_)
            | ServerError::ShuttingDown
            | ServerError::TlsHandshake(_)
            | ServerError::Metrics(_) => GatewayError::StoreUnavailable(self.to_string()),
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.to_gateway_error().is_retryable()
    }
}

impl From<prometheus::Error> for ServerError {
    fn from(err: prometheus::Error) -> Self {
        ServerError::Metrics(err.to_string())
    }
}
