//! oneM2M response status codes.

use crate::coap::CoapCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// oneM2M response status code (`rsc`).
///
/// These values are part of the oneM2M wire contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ResponseStatusCode {
    Ok,
    Created,
    Deleted,
    Updated,
    BadRequest,
    NotFound,
    OperationNotAllowed,
    ContentsUnacceptable,
    AccessDenied,
    Conflict,
    InternalServerError,
    NotImplemented,
    TargetNotReachable,
    AlreadyExists,
    TargetNotSubscribable,
    NonBlockingRequestNotSupported,
    InvalidArguments,
    InsufficientArguments,
}

impl ResponseStatusCode {
    /// Numeric oneM2M code.
    pub fn code(&self) -> u16 {
        match self {
            ResponseStatusCode::Ok => 2000,
            ResponseStatusCode::Created => 2001,
            ResponseStatusCode::Deleted => 2002,
            ResponseStatusCode::Updated => 2004,
            ResponseStatusCode::BadRequest => 4000,
            ResponseStatusCode::NotFound => 4004,
            ResponseStatusCode::OperationNotAllowed => 4005,
            ResponseStatusCode::ContentsUnacceptable => 4102,
            ResponseStatusCode::AccessDenied => 4103,
            ResponseStatusCode::Conflict => 4105,
            ResponseStatusCode::InternalServerError => 5000,
            ResponseStatusCode::NotImplemented => 5001,
            ResponseStatusCode::TargetNotReachable => 5103,
            ResponseStatusCode::AlreadyExists => 5106,
            ResponseStatusCode::TargetNotSubscribable => 5203,
            ResponseStatusCode::NonBlockingRequestNotSupported => 5206,
            ResponseStatusCode::InvalidArguments => 6023,
            ResponseStatusCode::InsufficientArguments => 6024,
        }
    }

    /// Parses a numeric oneM2M code.
    pub fn from_code(code: u16) -> Option<Self> {
        let status = match code {
            2000 => ResponseStatusCode::Ok,
            2001 => ResponseStatusCode::Created,
            2002 => ResponseStatusCode::Deleted,
            2004 => ResponseStatusCode::Updated,
            4000 => ResponseStatusCode::BadRequest,
            4004 => ResponseStatusCode::NotFound,
            4005 => ResponseStatusCode::OperationNotAllowed,
            4102 => ResponseStatusCode::ContentsUnacceptable,
            4103 => ResponseStatusCode::AccessDenied,
            4105 => ResponseStatusCode::Conflict,
            5000 => ResponseStatusCode::InternalServerError,
            5001 => ResponseStatusCode::NotImplemented,
            5103 => ResponseStatusCode::TargetNotReachable,
            5106 => ResponseStatusCode::AlreadyExists,
            5203 => ResponseStatusCode::TargetNotSubscribable,
            5206 => ResponseStatusCode::NonBlockingRequestNotSupported,
            6023 => ResponseStatusCode::InvalidArguments,
            6024 => ResponseStatusCode::InsufficientArguments,
            _ => return None,
        };
        Some(status)
    }

    /// Returns whether this is a 2xxx success code.
    pub fn is_success(&self) -> bool {
        (2000..3000).contains(&self.code())
    }

    /// HTTP status code carried alongside `X-M2M-RSC`.
    pub fn http_status(&self) -> u16 {
        match self {
            ResponseStatusCode::Ok
            | ResponseStatusCode::Deleted
            | ResponseStatusCode::Updated => 200,
            ResponseStatusCode::Created => 201,
            ResponseStatusCode::NotFound | ResponseStatusCode::TargetNotReachable => 404,
            ResponseStatusCode::AccessDenied
            | ResponseStatusCode::AlreadyExists
            | ResponseStatusCode::TargetNotSubscribable => 403,
            ResponseStatusCode::OperationNotAllowed => 405,
            ResponseStatusCode::Conflict => 409,
            ResponseStatusCode::InternalServerError => 500,
            ResponseStatusCode::NotImplemented
            | ResponseStatusCode::NonBlockingRequestNotSupported => 501,
            ResponseStatusCode::BadRequest
            | ResponseStatusCode::ContentsUnacceptable
            | ResponseStatusCode::InvalidArguments
            | ResponseStatusCode::InsufficientArguments => 400,
        }
    }

    /// CoAP response code carried alongside option 265.
    pub fn coap_code(&self) -> CoapCode {
        match self {
            ResponseStatusCode::Ok => CoapCode::CONTENT,
            ResponseStatusCode::Created => CoapCode::CREATED,
            ResponseStatusCode::Deleted => CoapCode::DELETED,
            ResponseStatusCode::Updated => CoapCode::CHANGED,
            ResponseStatusCode::NotFound => CoapCode::NOT_FOUND,
            ResponseStatusCode::OperationNotAllowed => CoapCode::METHOD_NOT_ALLOWED,
            ResponseStatusCode::AccessDenied
            | ResponseStatusCode::Conflict
            | ResponseStatusCode::TargetNotSubscribable => CoapCode::FORBIDDEN,
            ResponseStatusCode::InternalServerError
            | ResponseStatusCode::NonBlockingRequestNotSupported => {
                CoapCode::INTERNAL_SERVER_ERROR
            }
            ResponseStatusCode::NotImplemented => CoapCode::NOT_IMPLEMENTED,
            ResponseStatusCode::TargetNotReachable => CoapCode::GATEWAY_TIMEOUT,
            ResponseStatusCode::BadRequest
            | ResponseStatusCode::ContentsUnacceptable
            | ResponseStatusCode::AlreadyExists
            | ResponseStatusCode::InvalidArguments
            | ResponseStatusCode::InsufficientArguments => CoapCode::BAD_REQUEST,
        }
    }

    /// Best-effort status for an HTTP response that carries no `X-M2M-RSC`.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            201 => ResponseStatusCode::Created,
            200..=299 => ResponseStatusCode::Ok,
            400 => ResponseStatusCode::BadRequest,
            403 => ResponseStatusCode::AccessDenied,
            404 => ResponseStatusCode::NotFound,
            405 => ResponseStatusCode::OperationNotAllowed,
            409 => ResponseStatusCode::Conflict,
            501 => ResponseStatusCode::NotImplemented,
            _ => ResponseStatusCode::InternalServerError,
        }
    }

    /// Best-effort status for a CoAP response without option 265.
    pub fn from_coap_code(code: CoapCode) -> Self {
        match code {
            CoapCode::CREATED => ResponseStatusCode::Created,
            CoapCode::DELETED => ResponseStatusCode::Deleted,
            CoapCode::CHANGED => ResponseStatusCode::Updated,
            c if c.is_success() => ResponseStatusCode::Ok,
            CoapCode::BAD_REQUEST => ResponseStatusCode::BadRequest,
            CoapCode::FORBIDDEN => ResponseStatusCode::AccessDenied,
            CoapCode::NOT_FOUND => ResponseStatusCode::NotFound,
            CoapCode::METHOD_NOT_ALLOWED => ResponseStatusCode::OperationNotAllowed,
            CoapCode::NOT_IMPLEMENTED => ResponseStatusCode::NotImplemented,
            CoapCode::GATEWAY_TIMEOUT => ResponseStatusCode::TargetNotReachable,
            _ => ResponseStatusCode::InternalServerError,
        }
    }
}

impl From<ResponseStatusCode> for u16 {
    fn from(status: ResponseStatusCode) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for ResponseStatusCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        ResponseStatusCode::from_code(code).ok_or_else(|| format!("unknown status code {}", code))
    }
}

impl fmt::Display for ResponseStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
