//! CoAP binding.
//!
//! Originator (option 256) and request id (option 257) are mandatory.
//! The resource type comes from option 267 or the `ty` Uri-Query.

use super::{parse_body, reject_misplaced_type, ProtocolAdapter, QueryPrimitives};
use iotdm_protocol::coap::{option, CoapCode, CoapMessage};
use iotdm_protocol::{
    content_type, uri, GatewayError, Operation, Protocol, RequestPrimitive, ResourceType,
    ResponsePrimitive, SecurityLevel,
};
use std::net::SocketAddr;

/// A decoded CoAP request and its sender.
#[derive(Debug, Clone)]
pub struct CoapInbound {
    pub message: CoapMessage,
    pub peer: SocketAddr,
}

impl CoapInbound {
    pub fn new(message: CoapMessage, peer: SocketAddr) -> Self {
        Self { message, peer }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoapAdapter;

fn required(message: &CoapMessage, number: u16, what: &str) -> Result<String, GatewayError> {
    message
        .string_option(number)?
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| GatewayError::BadRequest(format!("{} is missing", what)))
}

fn check_content_format(format: Option<u16>) -> Result<(), GatewayError> {
    match format {
        None
        | Some(content_type::COAP_RES_JSON)
        | Some(content_type::COAP_NTFY_JSON)
        | Some(content_type::COAP_JSON) => Ok(()),
        Some(content_type::COAP_RES_XML) | Some(content_type::COAP_NTFY_XML) => Err(
            GatewayError::BadRequest("XML content format is not supported".into()),
        ),
        Some(other) => Err(GatewayError::BadRequest(format!(
            "Unsupported content format: {}",
            other
        ))),
    }
}

impl ProtocolAdapter for CoapAdapter {
    type Inbound = CoapInbound;
    type Outbound = CoapMessage;

    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    fn parse_request(&self, inbound: &CoapInbound) -> Result<RequestPrimitive, GatewayError> {
        let message = &inbound.message;
        check_content_format(message.content_format()?)?;

        let from = required(message, option::ONEM2M_FR, "Request originator")?;
        let request_id = required(message, option::ONEM2M_RQI, "Request identifier")?;

        let query = QueryPrimitives::from_pairs(message.uri_queries()?)?;
        let resource_type = match message.uint_option(option::ONEM2M_TY)? {
            Some(code) => Some(
                u16::try_from(code)
                    .ok()
                    .and_then(ResourceType::from_code)
                    .ok_or_else(|| {
                        GatewayError::BadRequest(format!("invalid resource type: {}", code))
                    })?,
            ),
            None => query.resource_type,
        };

        let operation = match message.code {
            CoapCode::GET => Operation::Retrieve,
            CoapCode::POST if resource_type.is_some() => Operation::Create,
            CoapCode::POST => Operation::Notify,
            CoapCode::PUT => Operation::Update,
            CoapCode::DELETE => Operation::Delete,
            other => {
                return Err(GatewayError::BadRequest(format!(
                    "Unsupported CoAP method: {}",
                    other
                )))
            }
        };
        reject_misplaced_type(resource_type, operation == Operation::Create)?;

        let mut builder = RequestPrimitive::builder(operation, uri::to_canonical(&message.uri_path()?))
            .with_from(from)
            .with_request_id(request_id);
        if let Some(ty) = resource_type {
            builder = builder.with_resource_type(ty);
        }
        builder = query.apply(builder);
        if let Some(name) = message.string_option(option::ONEM2M_NM)? {
            builder = builder.with_name(name);
        }
        if let Some(ot) = message.string_option(option::ONEM2M_OT)? {
            builder = builder.with_originating_timestamp(ot);
        }
        if let Some(content) = parse_body(&message.payload)? {
            builder = builder.with_content(content, content_type::RES_JSON);
        }
        Ok(builder.build()?)
    }

    fn format_response(&self, inbound: &CoapInbound, response: &ResponsePrimitive) -> CoapMessage {
        let mut reply = CoapMessage::response_to(&inbound.message, response.status.coap_code());
        reply.add_uint_option(option::ONEM2M_RSC, u32::from(response.status.code()));
        reply.add_string_option(option::ONEM2M_RQI, &response.request_id);
        if let Some(location) = &response.content_location {
            for segment in uri::to_protocol(location).split('/').filter(|s| !s.is_empty()) {
                reply.add_string_option(option::LOCATION_PATH, segment);
            }
        }
        let body = response.body().unwrap_or_else(|e| {
            tracing::warn!("Dropping unserializable response content: {}", e);
            Vec::new()
        });
        if !body.is_empty() {
            reply.add_uint_option(option::CONTENT_FORMAT, u32::from(content_type::COAP_RES_JSON));
            reply = reply.with_payload(body);
        }
        reply
    }

    fn request_id(&self, inbound: &CoapInbound) -> Option<String> {
        inbound
            .message
            .string_option(option::ONEM2M_RQI)
            .ok()
            .flatten()
    }

    fn negotiated_level(&self, _inbound: &CoapInbound) -> SecurityLevel {
        SecurityLevel::L0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotdm_protocol::coap::MessageType;
    use iotdm_protocol::ResponseStatusCode;

    fn coap_request(code: CoapCode, path: &str) -> CoapMessage {
        let mut message =
            CoapMessage::new(MessageType::Confirmable, code, 0x1234).with_token(vec![7u8, 7]);
        message.set_uri_path(path);
        message.add_string_option(option::ONEM2M_FR, "CAE1");
        message.add_string_option(option::ONEM2M_RQI, "c-1");
        message
    }

    fn inbound(message: CoapMessage) -> CoapInbound {
        CoapInbound::new(message, "127.0.0.1:5683".parse().unwrap())
    }

    #[test]
    fn test_create_with_type_option() {
        let mut message = coap_request(CoapCode::POST, "/InCSE1").with_payload(r#"{"m2m:cnt":{}}"#);
        message.add_uint_option(option::ONEM2M_TY, 3);
        message.add_string_option(option::ONEM2M_NM, "cnt1");
        message.add_uint_option(option::CONTENT_FORMAT, content_type::COAP_RES_JSON as u32);

        let request = CoapAdapter.parse_request(&inbound(message)).unwrap();
        assert_eq!(request.operation(), Operation::Create);
        assert_eq!(request.resource_type(), Some(ResourceType::Container));
        assert_eq!(request.name(), Some("cnt1"));
        assert_eq!(request.from(), Some("CAE1"));
        assert_eq!(request.request_id(), "c-1");
        assert_eq!(request.to(), "InCSE1");
    }

    #[test]
    fn test_type_from_query_and_discovery() {
        let mut message = coap_request(CoapCode::POST, "/~/in-cse/InCSE1");
        message.add_string_option(option::URI_QUERY, "ty=2");
        let request = CoapAdapter.parse_request(&inbound(message)).unwrap();
        assert_eq!(request.operation(), Operation::Create);
        assert_eq!(request.to(), "/in-cse/InCSE1");

        let mut message = coap_request(CoapCode::GET, "/InCSE1");
        message.add_string_option(option::URI_QUERY, "fu=1");
        message.add_string_option(option::URI_QUERY, "lbl=room");
        let request = CoapAdapter.parse_request(&inbound(message)).unwrap();
        assert!(request.is_discovery());
        assert_eq!(request.filter().labels, vec!["room".to_string()]);
    }

    #[test]
    fn test_mandatory_options() {
        let message = CoapMessage::new(MessageType::Confirmable, CoapCode::GET, 1);
        let err = CoapAdapter.parse_request(&inbound(message)).unwrap_err();
        assert!(err.message().contains("originator"));

        let mut message = CoapMessage::new(MessageType::Confirmable, CoapCode::GET, 1);
        message.add_string_option(option::ONEM2M_FR, "CAE1");
        let err = CoapAdapter.parse_request(&inbound(message)).unwrap_err();
        assert!(err.message().contains("identifier"));
    }

    #[test]
    fn test_rejections() {
        let mut message = coap_request(CoapCode::GET, "/InCSE1");
        message.add_uint_option(option::ONEM2M_TY, 2);
        assert!(CoapAdapter.parse_request(&inbound(message)).is_err());

        let mut message = coap_request(CoapCode::PUT, "/InCSE1");
        message.add_uint_option(option::CONTENT_FORMAT, content_type::COAP_RES_XML as u32);
        assert!(matches!(
            CoapAdapter.parse_request(&inbound(message)),
            Err(GatewayError::BadRequest(m)) if m.contains("XML")
        ));
    }

    #[test]
    fn test_format_response() {
        let msg = inbound(coap_request(CoapCode::POST, "/InCSE1"));
        let response = ResponsePrimitive::new(ResponseStatusCode::Created, "c-1")
            .with_content(serde_json::json!({"m2m:ae": {"rn": "ae1"}}))
            .with_content_location("InCSE1/ae1");
        let reply = CoapAdapter.format_response(&msg, &response);

        assert_eq!(reply.message_type, MessageType::Acknowledgement);
        assert_eq!(reply.message_id, 0x1234);
        assert_eq!(reply.token.as_ref(), &[7, 7]);
        assert_eq!(reply.code, CoapCode::CREATED);
        assert_eq!(reply.uint_option(option::ONEM2M_RSC).unwrap(), Some(2001));
        assert_eq!(
            reply.string_option(option::ONEM2M_RQI).unwrap().as_deref(),
            Some("c-1")
        );
        let location: Vec<&[u8]> = reply
            .option_values(option::LOCATION_PATH)
            .map(|v| v.as_ref())
            .collect();
        assert_eq!(location, vec![&b"InCSE1"[..], &b"ae1"[..]]);
        assert_eq!(reply.content_format().unwrap(), Some(content_type::COAP_RES_JSON));
    }
}
