//! MQTT binding.
//!
//! Requests arrive on `/oneM2M/req/<originator>/<cse-id>/json` carrying a
//! JSON request primitive; responses go to
//! `/oneM2M/resp/<originator>/<cse-id>/json`.

use super::{reject_misplaced_type, ProtocolAdapter};
use bytes::Bytes;
use iotdm_client::mqtt::RESPONSE_TOPIC_PREFIX;
use iotdm_client::request::REQUEST_TOPIC_PREFIX;
use iotdm_protocol::{
    GatewayError, JsonRequest, JsonResponse, Operation, Protocol, RequestPrimitive,
    ResponsePrimitive, SecurityLevel,
};
use serde_json::Value;

/// A publish received on a request topic.
#[derive(Debug, Clone)]
pub struct MqttInbound {
    pub topic: String,
    pub payload: Bytes,
    /// Broker connection is TLS.
    pub secure: bool,
}

impl MqttInbound {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, secure: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            secure,
        }
    }
}

/// Publish answering an [`MqttInbound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOutbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Segments of a request topic.
#[derive(Debug, PartialEq, Eq)]
struct RequestTopic<'a> {
    originator: &'a str,
    cse_id: &'a str,
    format: &'a str,
}

fn parse_topic(topic: &str) -> Option<RequestTopic<'_>> {
    let rest = topic.strip_prefix(REQUEST_TOPIC_PREFIX)?;
    let mut parts = rest.split('/');
    let topic = RequestTopic {
        originator: parts.next().filter(|s| !s.is_empty())?,
        cse_id: parts.next().filter(|s| !s.is_empty())?,
        format: parts.next()?,
    };
    parts.next().is_none().then_some(topic)
}

pub struct MqttAdapter {
    cse_id: String,
}

impl MqttAdapter {
    pub fn new(cse_id: impl Into<String>) -> Self {
        Self {
            cse_id: cse_id.into(),
        }
    }

    /// Filter the gateway subscribes to for inbound requests.
    pub fn request_filter(&self) -> String {
        format!("{}+/{}/json", REQUEST_TOPIC_PREFIX, self.cse_id)
    }
}

impl ProtocolAdapter for MqttAdapter {
    type Inbound = MqttInbound;
    type Outbound = MqttOutbound;

    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn parse_request(&self, inbound: &MqttInbound) -> Result<RequestPrimitive, GatewayError> {
        let topic = parse_topic(&inbound.topic).ok_or_else(|| {
            GatewayError::BadRequest(format!("not a request topic: {}", inbound.topic))
        })?;
        if topic.format != "json" {
            return Err(GatewayError::BadRequest(format!(
                "Unsupported serialization: {}",
                topic.format
            )));
        }
        if topic.cse_id != self.cse_id {
            return Err(GatewayError::BadRequest(format!(
                "request addressed to {}",
                topic.cse_id
            )));
        }

        let mut value: Value = serde_json::from_slice(&inbound.payload)
            .map_err(|e| GatewayError::BadRequest(format!("invalid JSON primitive: {}", e)))?;
        if let Some(fields) = value.as_object_mut() {
            if !fields.contains_key("nm") {
                if let Some(rn) = fields.remove("rn") {
                    fields.insert("nm".to_string(), rn);
                }
            }
        }
        let json: JsonRequest = serde_json::from_value(value)
            .map_err(|e| GatewayError::BadRequest(format!("invalid JSON primitive: {}", e)))?;
        let request = json.into_primitive()?;
        reject_misplaced_type(
            request.resource_type(),
            request.operation() == Operation::Create,
        )?;
        Ok(request)
    }

    fn format_response(&self, inbound: &MqttInbound, response: &ResponsePrimitive) -> MqttOutbound {
        let originator = parse_topic(&inbound.topic)
            .map(|t| t.originator.to_string())
            .or_else(|| response.to.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let payload = serde_json::to_vec(&JsonResponse::from_primitive(response)).unwrap_or_else(|e| {
            tracing::warn!("Cannot serialize MQTT response: {}", e);
            Vec::new()
        });
        MqttOutbound {
            topic: format!("{}{}/{}/json", RESPONSE_TOPIC_PREFIX, originator, self.cse_id),
            payload,
        }
    }

    fn request_id(&self, inbound: &MqttInbound) -> Option<String> {
        let value: Value = serde_json::from_slice(&inbound.payload).ok()?;
        value.get("rqi")?.as_str().map(str::to_string)
    }

    fn negotiated_level(&self, inbound: &MqttInbound) -> SecurityLevel {
        if inbound.secure {
            SecurityLevel::L1
        } else {
            SecurityLevel::L0
        }
    }
}
