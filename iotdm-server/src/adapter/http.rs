//! HTTP binding.
//!
//! | oneM2M            | HTTP                                 |
//! |-------------------|--------------------------------------|
//! | op                | method (POST with `ty` = create)     |
//! | to                | request path                         |
//! | fr / rqi / nm / ot| `X-M2M-Origin` / `-RI` / `-NM` / `-OT` |
//! | ty                | `Content-Type` parameter or query    |
//! | rsc               | `X-M2M-RSC` plus HTTP status         |

use super::{parse_body, reject_misplaced_type, ProtocolAdapter, QueryPrimitives};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_LOCATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use iotdm_protocol::{
    content_type, header, uri, GatewayError, Operation, Protocol, RequestPrimitive,
    ResponsePrimitive, ResponseStatusCode, SecurityLevel,
};

/// A fully read HTTP request.
#[derive(Debug)]
pub struct HttpInbound {
    pub request: Request<Bytes>,
    /// Arrived over TLS.
    pub secure: bool,
}

impl HttpInbound {
    pub fn new(request: Request<Bytes>, secure: bool) -> Self {
        Self { request, secure }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Lower-cased `Content-Type`, defaulting to JSON.
    fn content_type(&self) -> String {
        self.header(CONTENT_TYPE.as_str())
            .unwrap_or(content_type::JSON)
            .to_ascii_lowercase()
    }
}

pub type HttpOutbound = Response<Full<Bytes>>;

/// Splits `media/type; ty=3` into the media type and its `ty` parameter.
fn split_content_type(value: &str) -> (&str, Option<&str>) {
    let mut parts = value.split(';').map(str::trim);
    let media = parts.next().unwrap_or_default();
    let ty = parts.find_map(|p| p.strip_prefix("ty="));
    (media, ty)
}

fn is_acceptable_media(media: &str) -> bool {
    media.is_empty() || media.ends_with("json")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpAdapter;

impl ProtocolAdapter for HttpAdapter {
    type Inbound = HttpInbound;
    type Outbound = HttpOutbound;

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn parse_request(&self, inbound: &HttpInbound) -> Result<RequestPrimitive, GatewayError> {
        let request = &inbound.request;

        let media_header = inbound.content_type();
        let (media, ct_type) = split_content_type(&media_header);
        if !is_acceptable_media(media) {
            return Err(GatewayError::BadRequest(format!(
                "Unsupported media type: {}",
                media
            )));
        }

        let from = inbound
            .header(header::ORIGIN)
            .ok_or_else(|| GatewayError::BadRequest("Request originator is missing".into()))?;

        let query = QueryPrimitives::parse(request.uri().query().unwrap_or_default())?;
        let resource_type = match ct_type {
            Some(ty) => Some(iotdm_protocol::ResourceType::parse(ty)?),
            None => query.resource_type,
        };

        let operation = match request.method() {
            &Method::GET => Operation::Retrieve,
            &Method::POST if resource_type.is_some() => Operation::Create,
            &Method::POST => Operation::Notify,
            &Method::PUT => Operation::Update,
            &Method::DELETE => Operation::Delete,
            other => {
                return Err(GatewayError::BadRequest(format!(
                    "Unsupported method type: {}",
                    other
                )))
            }
        };
        reject_misplaced_type(resource_type, operation == Operation::Create)?;

        let path = urlencoding::decode(request.uri().path())
            .map_err(|_| GatewayError::BadRequest("request path is not UTF-8".into()))?;
        let mut builder = RequestPrimitive::builder(operation, uri::to_canonical(&path))
            .with_from(from);
        if let Some(rqi) = inbound.header(header::REQUEST_ID) {
            builder = builder.with_request_id(rqi);
        }
        if let Some(ty) = resource_type {
            builder = builder.with_resource_type(ty);
        }
        builder = query.apply(builder);
        if let Some(name) = inbound.header(header::NAME) {
            builder = builder.with_name(name);
        }
        if let Some(ot) = inbound.header(header::ORIGINATING_TIMESTAMP) {
            builder = builder.with_originating_timestamp(ot);
        }
        if let Some(content) = parse_body(request.body())? {
            let ct = if media.is_empty() { content_type::JSON } else { media };
            builder = builder.with_content(content, ct);
        }
        Ok(builder.build()?)
    }

    fn format_response(&self, inbound: &HttpInbound, response: &ResponsePrimitive) -> HttpOutbound {
        let media_header = inbound.content_type();
        let (media, _) = split_content_type(&media_header);
        let status = if response.status == ResponseStatusCode::BadRequest
            && !is_acceptable_media(media)
        {
            StatusCode::NOT_ACCEPTABLE
        } else {
            StatusCode::from_u16(response.status.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        };

        let body = response.body().unwrap_or_else(|e| {
            tracing::warn!("Dropping unserializable response content: {}", e);
            Vec::new()
        });
        let mut builder = Response::builder()
            .status(status)
            .header(header::RESPONSE_STATUS_CODE, response.status.code())
            .header(header::REQUEST_ID, response.request_id.as_str());
        if !body.is_empty() {
            builder = builder.header(
                CONTENT_TYPE,
                response.content_type.as_deref().unwrap_or(content_type::RES_JSON),
            );
        }
        if let Some(location) = &response.content_location {
            builder = builder.header(CONTENT_LOCATION, uri::to_protocol(location));
        }
        builder.body(Full::new(Bytes::from(body))).unwrap_or_else(|e| {
            tracing::warn!("Cannot build HTTP response: {}", e);
            let mut fallback = Response::new(Full::new(Bytes::new()));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }

    fn request_id(&self, inbound: &HttpInbound) -> Option<String> {
        inbound.header(header::REQUEST_ID).map(str::to_string)
    }

    fn negotiated_level(&self, inbound: &HttpInbound) -> SecurityLevel {
        if inbound.secure {
            SecurityLevel::L1
        } else {
            SecurityLevel::L0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use iotdm_protocol::{FilterUsage, ResourceType, ResultContent};

    fn inbound(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> HttpInbound {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        HttpInbound::new(builder.body(Bytes::from(body.to_string())).unwrap(), false)
    }

    fn origin() -> (&'static str, &'static str) {
        (header::ORIGIN, "CAE1")
    }

    #[test]
    fn test_create_from_content_type_parameter() {
        let msg = inbound(
            Method::POST,
            "/InCSE1?rcn=0",
            &[
                origin(),
                (header::REQUEST_ID, "r1"),
                (header::NAME, "ae1"),
                ("content-type", "application/vnd.onem2m-res+json; ty=2"),
            ],
            r#"{"m2m:ae":{"api":"app"}}"#,
        );
        let request = HttpAdapter.parse_request(&msg).unwrap();
        assert_eq!(request.operation(), Operation::Create);
        assert_eq!(request.to(), "InCSE1");
        assert_eq!(request.from(), Some("CAE1"));
        assert_eq!(request.request_id(), "r1");
        assert_eq!(request.resource_type(), Some(ResourceType::Ae));
        assert_eq!(request.name(), Some("ae1"));
        assert_eq!(request.result_content(), Some(ResultContent::Nothing));
        assert_eq!(request.content_type(), Some(content_type::RES_JSON));
        assert_eq!(request.content().unwrap()["m2m:ae"]["api"], "app");
    }

    #[test]
    fn test_post_without_type_is_notify() {
        let msg = inbound(Method::POST, "/InCSE1/ae1", &[origin()], "{}");
        let request = HttpAdapter.parse_request(&msg).unwrap();
        assert_eq!(request.operation(), Operation::Notify);
        // missing X-M2M-RI gets a generated id
        assert!(!request.request_id().is_empty());
    }

    #[test]
    fn test_type_on_get_rejected() {
        let msg = inbound(Method::GET, "/InCSE1?ty=3", &[origin()], "");
        assert!(matches!(
            HttpAdapter.parse_request(&msg),
            Err(GatewayError::BadRequest(m)) if m.contains("resource type")
        ));
    }

    #[test]
    fn test_discovery_and_address_forms() {
        let msg = inbound(Method::GET, "/~/in-cse/InCSE1?fu=1&rty=3&lim=2", &[origin()], "");
        let request = HttpAdapter.parse_request(&msg).unwrap();
        assert!(request.is_discovery());
        assert_eq!(request.to(), "/in-cse/InCSE1");
        assert_eq!(request.filter().filter_usage, Some(FilterUsage::Discovery));
        assert_eq!(request.filter().limit, Some(2));

        let msg = inbound(Method::DELETE, "/_/sp/in-cse/InCSE1/ae%201", &[origin()], "");
        let request = HttpAdapter.parse_request(&msg).unwrap();
        assert_eq!(request.operation(), Operation::Delete);
        assert_eq!(request.to(), "//sp/in-cse/InCSE1/ae 1");
    }

    #[test]
    fn test_missing_originator_and_bad_method() {
        let msg = inbound(Method::GET, "/InCSE1", &[], "");
        assert!(matches!(
            HttpAdapter.parse_request(&msg),
            Err(GatewayError::BadRequest(m)) if m.contains("originator")
        ));

        let msg = inbound(Method::PATCH, "/InCSE1", &[origin()], "");
        assert!(HttpAdapter.parse_request(&msg).is_err());

        let msg = inbound(Method::PUT, "/InCSE1", &[origin()], "{not json");
        assert!(HttpAdapter.parse_request(&msg).is_err());
    }

    #[tokio::test]
    async fn test_xml_rejected_with_not_acceptable() {
        let msg = inbound(
            Method::GET,
            "/InCSE1",
            &[origin(), (header::REQUEST_ID, "x1"), ("content-type", content_type::RES_XML)],
            "",
        );
        let err = HttpAdapter.parse_request(&msg).unwrap_err();
        let response = ResponsePrimitive::from_error(&err, "x1");
        let outbound = HttpAdapter.format_response(&msg, &response);
        assert_eq!(outbound.status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(outbound.headers()[header::RESPONSE_STATUS_CODE], "4000");
        assert_eq!(outbound.headers()[header::REQUEST_ID], "x1");
    }

    #[tokio::test]
    async fn test_format_created_response() {
        let msg = inbound(Method::POST, "/InCSE1?ty=3", &[origin()], "");
        let response = ResponsePrimitive::new(ResponseStatusCode::Created, "r9")
            .with_content(serde_json::json!({"m2m:cnt": {"rn": "cnt1"}}))
            .with_content_location("InCSE1/cnt1");
        let outbound = HttpAdapter.format_response(&msg, &response);

        assert_eq!(outbound.status(), StatusCode::CREATED);
        assert_eq!(outbound.headers()[header::RESPONSE_STATUS_CODE], "2001");
        assert_eq!(outbound.headers()[CONTENT_LOCATION], "/InCSE1/cnt1");
        assert_eq!(outbound.headers()[CONTENT_TYPE], content_type::RES_JSON);
        let body = outbound.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["m2m:cnt"]["rn"], "cnt1");
    }

    #[test]
    fn test_negotiated_level() {
        let mut msg = inbound(Method::GET, "/InCSE1", &[origin()], "");
        assert_eq!(HttpAdapter.negotiated_level(&msg), SecurityLevel::L0);
        msg.secure = true;
        assert_eq!(HttpAdapter.negotiated_level(&msg), SecurityLevel::L1);
    }
}
