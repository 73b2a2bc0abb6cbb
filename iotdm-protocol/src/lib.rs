//! # iotdm-protocol
//!
//! oneM2M protocol model for iotdm.
//!
//! This crate provides:
//! - Canonical request/response primitives shared by every transport
//! - Response status codes and their HTTP/CoAP mappings
//! - The gateway error taxonomy
//! - Translation between protocol URIs and canonical oneM2M addresses
//! - CoAP (RFC 7252) message codec
//! - MQTT 3.1.1 packet codec

pub mod coap;
pub mod error;
pub mod mqtt;
pub mod primitive;
pub mod status;
pub mod uri;

pub use error::{GatewayError, ProtocolError};
pub use primitive::{
    content_type, generate_request_id, header, m2m_timestamp, FilterCriteria, FilterUsage,
    JsonRequest, JsonResponse, Operation, Protocol, RequestPrimitive, RequestPrimitiveBuilder,
    ResourceType, ResponsePrimitive, ResultContent, SecurityLevel,
};
pub use status::ResponseStatusCode;

/// Default HTTP port of a oneM2M CSE.
pub const DEFAULT_HTTP_PORT: u16 = 8282;

/// Default CoAP port.
pub const DEFAULT_COAP_PORT: u16 = 5683;

/// Default MQTT broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Maximum accepted payload size (4 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
