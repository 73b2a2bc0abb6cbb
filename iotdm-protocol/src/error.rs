//! Protocol error types and the gateway error taxonomy.

use crate::status::ResponseStatusCode;
use thiserror::Error;

/// Errors raised while decoding or encoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported CoAP version: {0}")]
    UnsupportedVersion(u8),

    #[error("message truncated: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("invalid token length: {0}")]
    InvalidTokenLength(u8),

    #[error("invalid option encoding: {0}")]
    InvalidOption(&'static str),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("unknown packet type: {0:#x}")]
    UnknownPacketType(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Error taxonomy every pipeline failure is classified into.
///
/// Each entry maps to exactly one oneM2M response status code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("transport send failure: {0}")]
    TransportSendFailure(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Returns the oneM2M status code reported for this error.
    pub fn status_code(&self) -> ResponseStatusCode {
        match self {
            GatewayError::BadRequest(_) => ResponseStatusCode::BadRequest,
            GatewayError::Forbidden(_) => ResponseStatusCode::AccessDenied,
            GatewayError::NotFound(_) => ResponseStatusCode::NotFound,
            GatewayError::Conflict(_) => ResponseStatusCode::Conflict,
            GatewayError::StoreUnavailable(_) => ResponseStatusCode::InternalServerError,
            GatewayError::TransportSendFailure(_) => ResponseStatusCode::TargetNotReachable,
            GatewayError::Config(_) => ResponseStatusCode::InternalServerError,
        }
    }

    /// Returns the human-readable message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            GatewayError::BadRequest(m)
            | GatewayError::Forbidden(m)
            | GatewayError::NotFound(m)
            | GatewayError::Conflict(m)
            | GatewayError::StoreUnavailable(m)
            | GatewayError::TransportSendFailure(m)
            | GatewayError::Config(m) => m,
        }
    }

    /// Returns whether a caller may retry the request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::StoreUnavailable(_) | GatewayError::TransportSendFailure(_)
        )
    }
}

impl From<ProtocolError> for GatewayError {
    fn from(err: ProtocolError) -> Self {
        GatewayError::BadRequest(err.to_string())
    }
}
