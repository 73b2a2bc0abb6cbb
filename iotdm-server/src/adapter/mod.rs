//! Protocol adapters.
//!
//! Each transport converts its native message into a [`RequestPrimitive`]
//! and a [`ResponsePrimitive`] back into its native response. The Rx
//! pipeline sees only the tagged [`Inbound`]/[`Outbound`] unions and picks
//! the adapter by [`Protocol`].

pub mod coap;
pub mod http;
pub mod mqtt;

pub use self::coap::{CoapAdapter, CoapInbound};
pub use self::http::{HttpAdapter, HttpInbound, HttpOutbound};
pub use self::mqtt::{MqttAdapter, MqttInbound, MqttOutbound};

use iotdm_protocol::coap::CoapMessage;
use iotdm_protocol::{
    FilterCriteria, FilterUsage, GatewayError, Protocol, ProtocolError, RequestPrimitive,
    RequestPrimitiveBuilder, ResourceType, ResponsePrimitive, ResultContent, SecurityLevel,
};

/// Converts between one transport's native messages and canonical primitives.
pub trait ProtocolAdapter: Send + Sync {
    type Inbound;
    type Outbound;

    fn protocol(&self) -> Protocol;

    /// Builds the canonical request. Malformed input is a `BadRequest`.
    fn parse_request(&self, inbound: &Self::Inbound) -> Result<RequestPrimitive, GatewayError>;

    /// Builds the native response for a request.
    fn format_response(&self, inbound: &Self::Inbound, response: &ResponsePrimitive)
        -> Self::Outbound;

    /// Request id carried by the message, echoed even when parsing fails.
    fn request_id(&self, inbound: &Self::Inbound) -> Option<String>;

    /// Security level the message arrived with.
    fn negotiated_level(&self, inbound: &Self::Inbound) -> SecurityLevel;
}

/// Inbound message of any transport.
#[derive(Debug)]
pub enum Inbound {
    Http(HttpInbound),
    Coap(CoapInbound),
    Mqtt(MqttInbound),
}

impl Inbound {
    pub fn protocol(&self) -> Protocol {
        match self {
            Inbound::Http(_) => Protocol::Http,
            Inbound::Coap(_) => Protocol::Coap,
            Inbound::Mqtt(_) => Protocol::Mqtt,
        }
    }
}

/// Native response of any transport.
#[derive(Debug)]
pub enum Outbound {
    Http(HttpOutbound),
    Coap(CoapMessage),
    Mqtt(MqttOutbound),
}

/// One adapter per transport, selected by the inbound message's protocol.
pub struct Adapters {
    pub http: HttpAdapter,
    pub coap: CoapAdapter,
    pub mqtt: MqttAdapter,
}

impl Adapters {
    pub fn new(cse_id: impl Into<String>) -> Self {
        Self {
            http: HttpAdapter,
            coap: CoapAdapter,
            mqtt: MqttAdapter::new(cse_id),
        }
    }

    pub fn parse_request(&self, inbound: &Inbound) -> Result<RequestPrimitive, GatewayError> {
        match inbound {
            Inbound::Http(m) => self.http.parse_request(m),
            Inbound::Coap(m) => self.coap.parse_request(m),
            Inbound::Mqtt(m) => self.mqtt.parse_request(m),
        }
    }

    pub fn format_response(&self, inbound: &Inbound, response: &ResponsePrimitive) -> Outbound {
        match inbound {
            Inbound::Http(m) => Outbound::Http(self.http.format_response(m, response)),
            Inbound::Coap(m) => Outbound::Coap(self.coap.format_response(m, response)),
            Inbound::Mqtt(m) => Outbound::Mqtt(self.mqtt.format_response(m, response)),
        }
    }

    pub fn request_id(&self, inbound: &Inbound) -> Option<String> {
        match inbound {
            Inbound::Http(m) => self.http.request_id(m),
            Inbound::Coap(m) => self.coap.request_id(m),
            Inbound::Mqtt(m) => self.mqtt.request_id(m),
        }
    }

    pub fn negotiated_level(&self, inbound: &Inbound) -> SecurityLevel {
        match inbound {
            Inbound::Http(m) => self.http.negotiated_level(m),
            Inbound::Coap(m) => self.coap.negotiated_level(m),
            Inbound::Mqtt(m) => self.mqtt.negotiated_level(m),
        }
    }
}

/// Primitives carried in a query string or Uri-Query options.
///
/// `rt` (response type) is accepted and ignored: every request is answered
/// blocking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPrimitives {
    pub resource_type: Option<ResourceType>,
    pub result_content: Option<ResultContent>,
    pub name: Option<String>,
    pub filter: FilterCriteria,
}

impl QueryPrimitives {
    /// Parses decoded `(key, value)` pairs. Unknown keys are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = QueryPrimitives::default();
        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                "ty" => query.resource_type = Some(ResourceType::parse(value)?),
                "rcn" => query.result_content = Some(ResultContent::parse(value)?),
                "rn" => query.name = Some(value.to_string()),
                "fu" => query.filter.filter_usage = Some(FilterUsage::parse(value)?),
                "rty" => query.filter.resource_types.push(ResourceType::parse(value)?),
                "lim" => {
                    let limit = value.trim().parse::<usize>().map_err(|_| {
                        ProtocolError::InvalidValue {
                            field: "lim",
                            value: value.to_string(),
                        }
                    })?;
                    query.filter.limit = Some(limit);
                }
                "lbl" => query.filter.labels.extend(
                    value
                        .split('+')
                        .filter(|l| !l.is_empty())
                        .map(str::to_string),
                ),
                "rt" => {}
                other => tracing::trace!("Ignoring query parameter {}", other),
            }
        }
        Ok(query)
    }

    /// Parses a URL-encoded query string (`ty=3&rcn=1`).
    pub fn parse(query: &str) -> Result<Self, ProtocolError> {
        let mut pairs = Vec::new();
        for part in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            pairs.push((decode(key)?, decode(value)?));
        }
        Self::from_pairs(pairs)
    }

    /// Applies everything but the resource type to a builder.
    pub(crate) fn apply(self, mut builder: RequestPrimitiveBuilder) -> RequestPrimitiveBuilder {
        if let Some(rcn) = self.result_content {
            builder = builder.with_result_content(rcn);
        }
        if let Some(name) = self.name {
            builder = builder.with_name(name);
        }
        if !self.filter.is_empty() {
            builder = builder.with_filter(self.filter);
        }
        builder
    }
}

fn decode(value: &str) -> Result<String, ProtocolError> {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .map_err(|_| ProtocolError::InvalidUtf8("query string"))
}

/// Parses a non-empty JSON body.
pub(crate) fn parse_body(body: &[u8]) -> Result<Option<serde_json::Value>, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON content: {}", e)))
}

/// `ty` is only meaningful on a create.
pub(crate) fn reject_misplaced_type(
    resource_type: Option<ResourceType>,
    creating: bool,
) -> Result<(), GatewayError> {
    if resource_type.is_some() && !creating {
        return Err(GatewayError::BadRequest(
            "Specifying resource type not permitted".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_query_primitives() {
        let query = QueryPrimitives::parse("rcn=4&fu=1&rty=3&rty=4&lim=10&lbl=a%20b+c&rt=3&x=y")
            .unwrap();
        assert_eq!(query.result_content, Some(ResultContent::AttributesAndChildResources));
        assert_eq!(query.filter.filter_usage, Some(FilterUsage::Discovery));
        assert_eq!(
            query.filter.resource_types,
            vec![ResourceType::Container, ResourceType::ContentInstance]
        );
        assert_eq!(query.filter.limit, Some(10));
        assert_eq!(query.filter.labels, vec!["a b".to_string(), "c".to_string()]);
        assert_eq!(query.resource_type, None);
    }

    #[test]
    fn test_query_rejects_bad_values() {
        assert!(QueryPrimitives::parse("ty=99").is_err());
        assert!(QueryPrimitives::parse("rcn=9").is_err());
        assert!(QueryPrimitives::parse("lim=-1").is_err());
        assert!(QueryPrimitives::parse("fu=7").is_err());
        assert!(QueryPrimitives::parse("").unwrap().filter.is_empty());
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(b"").unwrap(), None);
        assert_eq!(parse_body(b" \n").unwrap(), None);
        assert!(parse_body(b"{\"m2m:ae\":{}}").unwrap().is_some());
        assert!(matches!(parse_body(b"<xml/>"), Err(GatewayError::BadRequest(_))));
    }

    proptest! {
        #[test]
        fn prop_query_never_panics(query in "[a-z=&%+0-9]{0,40}") {
            let _ = QueryPrimitives::parse(&query);
        }

        #[test]
        fn prop_limit_and_labels_survive_encoding(
            limit in 0usize..100_000,
            labels in proptest::collection::vec("[a-zA-Z0-9 /:]{1,12}", 1..4),
        ) {
            let encoded: Vec<String> = labels
                .iter()
                .map(|l| urlencoding::encode(l).into_owned())
                .collect();
            let query = QueryPrimitives::parse(&format!("lim={}&lbl={}", limit, encoded.join("+")))
                .unwrap();
            prop_assert_eq!(query.filter.limit, Some(limit));
            prop_assert_eq!(query.filter.labels, labels);
        }
    }
}
