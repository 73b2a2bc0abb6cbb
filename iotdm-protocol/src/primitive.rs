//! Canonical request and response primitives.
//!
//! Every transport adapter converts its native message into a
//! [`RequestPrimitive`] and renders a [`ResponsePrimitive`] back out. The
//! JSON forms used by the MQTT binding live here as well.

use crate::error::{GatewayError, ProtocolError};
use crate::status::ResponseStatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Media types used on the wire.
pub mod content_type {
    /// Resource representation, JSON serialization.
    pub const RES_JSON: &str = "application/vnd.onem2m-res+json";
    /// Notification, JSON serialization.
    pub const NTFY_JSON: &str = "application/vnd.onem2m-ntfy+json";
    /// Resource representation, XML serialization (recognized, never produced).
    pub const RES_XML: &str = "application/vnd.onem2m-res+xml";
    /// Plain JSON, accepted on input.
    pub const JSON: &str = "application/json";

    /// CoAP content-format numbers.
    pub const COAP_RES_XML: u16 = 10000;
    pub const COAP_RES_JSON: u16 = 10001;
    pub const COAP_NTFY_XML: u16 = 10002;
    pub const COAP_NTFY_JSON: u16 = 10003;
    /// `application/json` (RFC 7252).
    pub const COAP_JSON: u16 = 50;
}

/// oneM2M HTTP header names.
pub mod header {
    pub const ORIGIN: &str = "X-M2M-Origin";
    pub const REQUEST_ID: &str = "X-M2M-RI";
    pub const NAME: &str = "X-M2M-NM";
    pub const ORIGINATING_TIMESTAMP: &str = "X-M2M-OT";
    pub const RESPONSE_STATUS_CODE: &str = "X-M2M-RSC";
}

/// Transport a request arrived on or a notification leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Coap,
    Mqtt,
}

impl Protocol {
    /// All transports, in startup order.
    pub const ALL: [Protocol; 3] = [Protocol::Http, Protocol::Coap, Protocol::Mqtt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Coap => "coap",
            Protocol::Mqtt => "mqtt",
        }
    }

    /// Maps a URL scheme to the transport that serves it.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" | "https" => Some(Protocol::Http),
            "coap" | "coaps" => Some(Protocol::Coap),
            "mqtt" | "mqtts" => Some(Protocol::Mqtt),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport security level.
///
/// `L0` is plain, `L1` is TLS/DTLS. `L2` is defined by oneM2M but not
/// supported by this gateway and is rejected at validation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum SecurityLevel {
    #[default]
    #[serde(alias = "l0")]
    L0,
    #[serde(alias = "l1")]
    L1,
    #[serde(alias = "l2")]
    L2,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::L0 => f.write_str("L0"),
            SecurityLevel::L1 => f.write_str("L1"),
            SecurityLevel::L2 => f.write_str("L2"),
        }
    }
}

/// oneM2M operation (`op`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Operation {
    Create,
    Retrieve,
    Update,
    Delete,
    Notify,
}

impl Operation {
    pub fn code(&self) -> u8 {
        match self {
            Operation::Create => 1,
            Operation::Retrieve => 2,
            Operation::Update => 3,
            Operation::Delete => 4,
            Operation::Notify => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Operation::Create),
            2 => Some(Operation::Retrieve),
            3 => Some(Operation::Update),
            4 => Some(Operation::Delete),
            5 => Some(Operation::Notify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Retrieve => "retrieve",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Notify => "notify",
        }
    }
}

impl From<Operation> for u8 {
    fn from(op: Operation) -> Self {
        op.code()
    }
}

impl TryFrom<u8> for Operation {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Operation::from_code(code).ok_or_else(|| format!("unknown operation {}", code))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result content directive (`rcn`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResultContent {
    Nothing,
    #[default]
    Attributes,
    HierarchicalAddress,
    HierarchicalAddressAndAttributes,
    AttributesAndChildResources,
    AttributesAndChildReferences,
    ChildReferences,
}

impl ResultContent {
    pub fn code(&self) -> u8 {
        match self {
            ResultContent::Nothing => 0,
            ResultContent::Attributes => 1,
            ResultContent::HierarchicalAddress => 2,
            ResultContent::HierarchicalAddressAndAttributes => 3,
            ResultContent::AttributesAndChildResources => 4,
            ResultContent::AttributesAndChildReferences => 5,
            ResultContent::ChildReferences => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(ResultContent::Nothing),
            1 => Ok(ResultContent::Attributes),
            2 => Ok(ResultContent::HierarchicalAddress),
            3 => Ok(ResultContent::HierarchicalAddressAndAttributes),
            4 => Ok(ResultContent::AttributesAndChildResources),
            5 => Ok(ResultContent::AttributesAndChildReferences),
            6 => Ok(ResultContent::ChildReferences),
            other => Err(ProtocolError::InvalidValue {
                field: "rcn",
                value: other.to_string(),
            }),
        }
    }

    /// Parses the textual query-string form.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let code = value.trim().parse::<u8>().map_err(|_| ProtocolError::InvalidValue {
            field: "rcn",
            value: value.to_string(),
        })?;
        Self::from_code(code)
    }
}

/// Resource types the gateway stores.
///
/// Only the type tag and its short name are interpreted; attribute
/// semantics stay opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ResourceType {
    AccessControlPolicy,
    Ae,
    Container,
    ContentInstance,
    CseBase,
    Group,
    Node,
    RemoteCse,
    Subscription,
}

impl ResourceType {
    pub fn code(&self) -> u16 {
        match self {
            ResourceType::AccessControlPolicy => 1,
            ResourceType::Ae => 2,
            ResourceType::Container => 3,
            ResourceType::ContentInstance => 4,
            ResourceType::CseBase => 5,
            ResourceType::Group => 9,
            ResourceType::Node => 14,
            ResourceType::RemoteCse => 16,
            ResourceType::Subscription => 23,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let ty = match code {
            1 => ResourceType::AccessControlPolicy,
            2 => ResourceType::Ae,
            3 => ResourceType::Container,
            4 => ResourceType::ContentInstance,
            5 => ResourceType::CseBase,
            9 => ResourceType::Group,
            14 => ResourceType::Node,
            16 => ResourceType::RemoteCse,
            23 => ResourceType::Subscription,
            _ => return None,
        };
        Some(ty)
    }

    /// Short name used as the `m2m:` JSON wrapper key.
    pub fn short_name(&self) -> &'static str {
        match self {
            ResourceType::AccessControlPolicy => "acp",
            ResourceType::Ae => "ae",
            ResourceType::Container => "cnt",
            ResourceType::ContentInstance => "cin",
            ResourceType::CseBase => "cb",
            ResourceType::Group => "grp",
            ResourceType::Node => "nod",
            ResourceType::RemoteCse => "csr",
            ResourceType::Subscription => "sub",
        }
    }

    /// Parses the textual query-string form (`ty=3`).
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        value
            .trim()
            .parse::<u16>()
            .ok()
            .and_then(Self::from_code)
            .ok_or_else(|| ProtocolError::InvalidValue {
                field: "ty",
                value: value.to_string(),
            })
    }

    /// Whether the type may be created through a request.
    pub fn is_creatable(&self) -> bool {
        !matches!(self, ResourceType::CseBase)
    }
}

impl From<ResourceType> for u16 {
    fn from(ty: ResourceType) -> Self {
        ty.code()
    }
}

impl TryFrom<u16> for ResourceType {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        ResourceType::from_code(code).ok_or_else(|| format!("unknown resource type {}", code))
    }
}

/// Filter usage (`fu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterUsage {
    Discovery,
    ConditionalRetrieval,
}

impl FilterUsage {
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value.trim() {
            "1" => Ok(FilterUsage::Discovery),
            "2" => Ok(FilterUsage::ConditionalRetrieval),
            other => Err(ProtocolError::InvalidValue {
                field: "fu",
                value: other.to_string(),
            }),
        }
    }
}

/// Filter criteria attached to retrieve/discovery requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub filter_usage: Option<FilterUsage>,
    /// Only these resource types (empty = all).
    pub resource_types: Vec<ResourceType>,
    /// Maximum number of discovery results.
    pub limit: Option<usize>,
    /// Only resources carrying all of these labels (empty = all).
    pub labels: Vec<String>,
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        self.filter_usage.is_none()
            && self.resource_types.is_empty()
            && self.limit.is_none()
            && self.labels.is_empty()
    }
}

/// Normalized request, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPrimitive {
    operation: Operation,
    to: String,
    from: Option<String>,
    request_id: String,
    resource_type: Option<ResourceType>,
    name: Option<String>,
    content: Option<Value>,
    content_type: Option<String>,
    result_content: Option<ResultContent>,
    filter: FilterCriteria,
    originating_timestamp: Option<String>,
}

impl RequestPrimitive {
    pub fn builder(operation: Operation, to: impl Into<String>) -> RequestPrimitiveBuilder {
        RequestPrimitiveBuilder::new(operation, to)
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Target address in canonical form.
    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn from(&self) -> Option<&str> {
        self.from.as_deref()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        self.resource_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn content(&self) -> Option<&Value> {
        self.content.as_ref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn result_content(&self) -> Option<ResultContent> {
        self.result_content
    }

    pub fn filter(&self) -> &FilterCriteria {
        &self.filter
    }

    pub fn originating_timestamp(&self) -> Option<&str> {
        self.originating_timestamp.as_deref()
    }

    /// A Retrieve with discovery filter usage.
    pub fn is_discovery(&self) -> bool {
        self.operation == Operation::Retrieve
            && self.filter.filter_usage == Some(FilterUsage::Discovery)
    }

    /// Re-opens the primitive for a derived request (e.g. forwarding).
    pub fn to_builder(&self) -> RequestPrimitiveBuilder {
        RequestPrimitiveBuilder {
            operation: self.operation,
            to: self.to.clone(),
            from: self.from.clone(),
            request_id: Some(self.request_id.clone()),
            resource_type: self.resource_type,
            name: self.name.clone(),
            content: self.content.clone(),
            content_type: self.content_type.clone(),
            result_content: self.result_content,
            filter: self.filter.clone(),
            originating_timestamp: self.originating_timestamp.clone(),
        }
    }
}

/// Builder for [`RequestPrimitive`].
#[derive(Debug, Clone)]
pub struct RequestPrimitiveBuilder {
    operation: Operation,
    to: String,
    from: Option<String>,
    request_id: Option<String>,
    resource_type: Option<ResourceType>,
    name: Option<String>,
    content: Option<Value>,
    content_type: Option<String>,
    result_content: Option<ResultContent>,
    filter: FilterCriteria,
    originating_timestamp: Option<String>,
}

impl RequestPrimitiveBuilder {
    pub fn new(operation: Operation, to: impl Into<String>) -> Self {
        Self {
            operation,
            to: to.into(),
            from: None,
            request_id: None,
            resource_type: None,
            name: None,
            content: None,
            content_type: None,
            result_content: None,
            filter: FilterCriteria::default(),
            originating_timestamp: None,
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_resource_type(mut self, ty: ResourceType) -> Self {
        self.resource_type = Some(ty);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_content(mut self, content: Value, content_type: impl Into<String>) -> Self {
        self.content = Some(content);
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_result_content(mut self, rcn: ResultContent) -> Self {
        self.result_content = Some(rcn);
        self
    }

    pub fn with_filter(mut self, filter: FilterCriteria) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_originating_timestamp(mut self, ts: impl Into<String>) -> Self {
        self.originating_timestamp = Some(ts.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    /// Finalizes the primitive. A missing request-id is generated.
    pub fn build(self) -> Result<RequestPrimitive, ProtocolError> {
        if self.to.trim().is_empty() {
            return Err(ProtocolError::MissingField("to"));
        }
        let request_id = match self.request_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => generate_request_id(),
        };
        Ok(RequestPrimitive {
            operation: self.operation,
            to: self.to,
            from: self.from,
            request_id,
            resource_type: self.resource_type,
            name: self.name,
            content: self.content,
            content_type: self.content_type,
            result_content: self.result_content,
            filter: self.filter,
            originating_timestamp: self.originating_timestamp,
        })
    }
}

/// Response produced exactly once per request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePrimitive {
    pub status: ResponseStatusCode,
    pub request_id: String,
    pub content: Option<Value>,
    pub content_type: Option<String>,
    /// Hierarchical address of a created resource.
    pub content_location: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl ResponsePrimitive {
    pub fn new(status: ResponseStatusCode, request_id: impl Into<String>) -> Self {
        Self {
            status,
            request_id: request_id.into(),
            content: None,
            content_type: None,
            content_location: None,
            from: None,
            to: None,
        }
    }

    /// Builds the error response for a classified failure.
    pub fn from_error(err: &GatewayError, request_id: impl Into<String>) -> Self {
        Self::new(err.status_code(), request_id).with_content(json!({ "m2m:dbg": err.message() }))
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self.content_type = Some(content_type::RES_JSON.to_string());
        self
    }

    pub fn with_content_location(mut self, location: impl Into<String>) -> Self {
        self.content_location = Some(location.into());
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Serialized content body, empty when there is none.
    pub fn body(&self) -> Result<Vec<u8>, ProtocolError> {
        match &self.content {
            Some(content) => Ok(serde_json::to_vec(content)?),
            None => Ok(Vec::new()),
        }
    }
}

/// JSON request primitive used by the MQTT binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rqi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ty: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rcn: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc: Option<Value>,
}

impl JsonRequest {
    pub fn from_primitive(request: &RequestPrimitive) -> Self {
        Self {
            op: Some(request.operation().code()),
            to: Some(request.to().to_string()),
            fr: request.from().map(str::to_string),
            rqi: Some(request.request_id().to_string()),
            ty: request.resource_type().map(|t| t.code()),
            nm: request.name().map(str::to_string),
            rcn: request.result_content().map(|r| r.code()),
            ot: request.originating_timestamp().map(str::to_string),
            pc: request.content().cloned(),
        }
    }

    /// Converts into a canonical primitive. `op`, `to`, `fr` and `rqi` are mandatory.
    pub fn into_primitive(self) -> Result<RequestPrimitive, ProtocolError> {
        let op = self.op.ok_or(ProtocolError::MissingField("op"))?;
        let operation = Operation::from_code(op).ok_or_else(|| ProtocolError::InvalidValue {
            field: "op",
            value: op.to_string(),
        })?;
        let to = self.to.ok_or(ProtocolError::MissingField("to"))?;
        let from = self.fr.ok_or(ProtocolError::MissingField("fr"))?;
        let request_id = self.rqi.ok_or(ProtocolError::MissingField("rqi"))?;

        let mut builder = RequestPrimitive::builder(operation, to)
            .with_from(from)
            .with_request_id(request_id);
        if let Some(ty) = self.ty {
            let ty = ResourceType::from_code(ty).ok_or_else(|| ProtocolError::InvalidValue {
                field: "ty",
                value: ty.to_string(),
            })?;
            builder = builder.with_resource_type(ty);
        }
        if let Some(nm) = self.nm {
            builder = builder.with_name(nm);
        }
        if let Some(rcn) = self.rcn {
            builder = builder.with_result_content(ResultContent::from_code(rcn)?);
        }
        if let Some(ot) = self.ot {
            builder = builder.with_originating_timestamp(ot);
        }
        if let Some(pc) = self.pc {
            builder = builder.with_content(pc, content_type::RES_JSON);
        }
        builder.build()
    }
}

/// JSON response primitive used by the MQTT binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonResponse {
    pub rsc: u16,
    pub rqi: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fr: Option<String>,
}

impl JsonResponse {
    pub fn from_primitive(response: &ResponsePrimitive) -> Self {
        Self {
            rsc: response.status.code(),
            rqi: response.request_id.clone(),
            pc: response.content.clone(),
            to: response.to.clone(),
            fr: response.from.clone(),
        }
    }

    pub fn into_primitive(self) -> Result<ResponsePrimitive, ProtocolError> {
        let status =
            ResponseStatusCode::from_code(self.rsc).ok_or_else(|| ProtocolError::InvalidValue {
                field: "rsc",
                value: self.rsc.to_string(),
            })?;
        let mut response = ResponsePrimitive::new(status, self.rqi);
        if let Some(pc) = self.pc {
            response = response.with_content(pc);
        }
        response.from = self.fr;
        response.to = self.to;
        Ok(response)
    }
}

/// Generates a fresh request identifier.
pub fn generate_request_id() -> String {
    format!("rqi-{}", uuid::Uuid::new_v4().simple())
}

/// Formats a timestamp in the oneM2M basic format (`YYYYMMDDTHHMMSS`).
pub fn m2m_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S").to_string()
}
