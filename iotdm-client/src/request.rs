//! Tx requests and their pipeline hooks.
//!
//! A [`TxRequest`] carries one outbound request through the stages of
//! [`TxPipeline`](crate::tx::TxPipeline). The variant is chosen by the
//! destination protocol and holds that protocol's wire request and reply.

use crate::config::ProtocolClientConfig;
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::mqtt::RESPONSE_TOPIC_PREFIX;
use crate::pool::{ClientPool, TransportClient};
use crate::tx::{TxHooks, TxStage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::{ACCEPT, CONTENT_LOCATION, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response};
use iotdm_protocol::coap::{option, CoapCode, CoapMessage, MessageType};
use iotdm_protocol::uri::{self, Address};
use iotdm_protocol::{
    content_type, header, m2m_timestamp, FilterUsage, JsonRequest, JsonResponse, Operation,
    Protocol, RequestPrimitive, ResponsePrimitive, ResponseStatusCode,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Topic prefix of oneM2M request messages.
pub const REQUEST_TOPIC_PREFIX: &str = "/oneM2M/req/";

/// Why a request is sent.
#[derive(Debug)]
pub enum TxPurpose {
    /// Fire a notification; any reply is discarded.
    Notify,
    /// Forward a request to another CSE and hand the reply back.
    Route {
        reply: Option<oneshot::Sender<ResponsePrimitive>>,
    },
}

impl TxPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxPurpose::Notify => "notification",
            TxPurpose::Route { .. } => "routed request",
        }
    }
}

/// State shared by every protocol variant.
#[derive(Debug)]
pub struct TxContext {
    pub endpoint: Endpoint,
    pub primitive: RequestPrimitive,
    pub config: ProtocolClientConfig,
    /// CSE-ID of this gateway.
    pub sender: String,
    pub purpose: TxPurpose,
    /// Translated remote response (routed requests only).
    pub response: Option<ResponsePrimitive>,
    /// Cause of the failure, if a hook failed.
    pub failure: Option<String>,
}

impl TxContext {
    pub fn new(
        endpoint: Endpoint,
        primitive: RequestPrimitive,
        config: ProtocolClientConfig,
        sender: impl Into<String>,
        purpose: TxPurpose,
    ) -> Self {
        Self {
            endpoint,
            primitive,
            config,
            sender: sender.into(),
            purpose,
            response: None,
            failure: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self.purpose, TxPurpose::Notify)
    }

    fn fail(&mut self, stage: TxStage, cause: impl fmt::Display) -> bool {
        let cause = cause.to_string();
        tracing::debug!(
            "{} {} to {}: {}",
            self.purpose.as_str(),
            stage,
            self.endpoint,
            cause
        );
        self.failure = Some(cause);
        false
    }
}

/// HTTP request state.
#[derive(Debug)]
pub struct HttpTx {
    pub ctx: TxContext,
    pub wire: Option<Request<Full<Bytes>>>,
    pub reply: Option<Response<Bytes>>,
}

/// CoAP request state.
#[derive(Debug)]
pub struct CoapTx {
    pub ctx: TxContext,
    pub wire: Option<CoapMessage>,
    pub reply: Option<CoapMessage>,
}

/// MQTT publish built by `translate_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttWire {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Filter the reply arrives on (routed requests only).
    pub response_filter: Option<String>,
}

/// MQTT request state.
#[derive(Debug)]
pub struct MqttTx {
    pub ctx: TxContext,
    pub wire: Option<MqttWire>,
    pub reply: Option<JsonResponse>,
}

/// An outbound request, tagged by destination protocol.
#[derive(Debug)]
pub enum TxRequest {
    Http(HttpTx),
    Coap(CoapTx),
    Mqtt(MqttTx),
}

impl TxRequest {
    pub fn new(ctx: TxContext) -> Self {
        match ctx.endpoint.protocol {
            Protocol::Http => TxRequest::Http(HttpTx {
                ctx,
                wire: None,
                reply: None,
            }),
            Protocol::Coap => TxRequest::Coap(CoapTx {
                ctx,
                wire: None,
                reply: None,
            }),
            Protocol::Mqtt => TxRequest::Mqtt(MqttTx {
                ctx,
                wire: None,
                reply: None,
            }),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            TxRequest::Http(_) => Protocol::Http,
            TxRequest::Coap(_) => Protocol::Coap,
            TxRequest::Mqtt(_) => Protocol::Mqtt,
        }
    }

    pub fn ctx(&self) -> &TxContext {
        match self {
            TxRequest::Http(tx) => &tx.ctx,
            TxRequest::Coap(tx) => &tx.ctx,
            TxRequest::Mqtt(tx) => &tx.ctx,
        }
    }

    pub fn ctx_mut(&mut self) -> &mut TxContext {
        match self {
            TxRequest::Http(tx) => &mut tx.ctx,
            TxRequest::Coap(tx) => &mut tx.ctx,
            TxRequest::Mqtt(tx) => &mut tx.ctx,
        }
    }

    pub fn into_ctx(self) -> TxContext {
        match self {
            TxRequest::Http(tx) => tx.ctx,
            TxRequest::Coap(tx) => tx.ctx,
            TxRequest::Mqtt(tx) => tx.ctx,
        }
    }
}

/// A [`TxRequest`] bound to the pool it sends through.
pub struct TxJob {
    pool: Arc<ClientPool>,
    request: TxRequest,
}

impl TxJob {
    pub fn new(pool: Arc<ClientPool>, request: TxRequest) -> Self {
        Self { pool, request }
    }

    pub fn request(&self) -> &TxRequest {
        &self.request
    }

    pub fn into_request(self) -> TxRequest {
        self.request
    }
}

#[async_trait]
impl TxHooks for TxJob {
    async fn preprocess(&mut self) -> bool {
        let ctx = self.request.ctx_mut();
        if let TxPurpose::Route { reply: None } = ctx.purpose {
            return ctx.fail(TxStage::Preprocess, "no reply channel for routed request");
        }
        if ctx.primitive.from().is_some() && ctx.primitive.originating_timestamp().is_some() {
            return true;
        }

        let mut builder = ctx.primitive.to_builder();
        if ctx.primitive.from().is_none() {
            builder = builder.with_from(ctx.sender.clone());
        }
        if ctx.primitive.originating_timestamp().is_none() {
            builder = builder.with_originating_timestamp(m2m_timestamp(Utc::now()));
        }
        match builder.build() {
            Ok(primitive) => {
                ctx.primitive = primitive;
                true
            }
            Err(e) => ctx.fail(TxStage::Preprocess, e),
        }
    }

    async fn translate_request(&mut self) -> bool {
        let result = match &mut self.request {
            TxRequest::Http(tx) => http_request(&tx.ctx).map(|wire| tx.wire = Some(wire)),
            TxRequest::Coap(tx) => coap_request(&tx.ctx).map(|wire| tx.wire = Some(wire)),
            TxRequest::Mqtt(tx) => mqtt_request(&tx.ctx).map(|wire| tx.wire = Some(wire)),
        };
        match result {
            Ok(()) => true,
            Err(e) => self.request.ctx_mut().fail(TxStage::TranslateRequest, e),
        }
    }

    async fn send(&mut self) -> bool {
        let ctx = self.request.ctx();
        let client = match self.pool.key_for(&ctx.endpoint, &ctx.config) {
            Ok(key) => self.pool.get(&key).await,
            Err(e) => Err(e),
        };
        let client = match client {
            Ok(client) => client,
            Err(e) => return self.request.ctx_mut().fail(TxStage::Send, e),
        };

        let timeout = self.pool.settings().request_timeout;
        match exchange(&mut self.request, &client, timeout).await {
            Ok(()) => true,
            Err(e) => self.request.ctx_mut().fail(TxStage::Send, e),
        }
    }

    async fn translate_response(&mut self) -> bool {
        let result = match &mut self.request {
            TxRequest::Http(tx) => http_response(&tx.ctx, tx.reply.take()),
            TxRequest::Coap(tx) => coap_response(&tx.ctx, tx.reply.take()),
            TxRequest::Mqtt(tx) => mqtt_response(&tx.ctx, tx.reply.take()),
        };
        let ctx = self.request.ctx_mut();
        match result {
            Ok(response) => {
                ctx.response = response;
                true
            }
            Err(e) => ctx.fail(TxStage::TranslateResponse, e),
        }
    }

    async fn respond(&mut self) -> bool {
        let ctx = self.request.ctx_mut();
        let delivered = match &mut ctx.purpose {
            TxPurpose::Notify => return true,
            TxPurpose::Route { reply } => match (reply.take(), ctx.response.take()) {
                (Some(reply), Some(response)) => reply
                    .send(response)
                    .map_err(|_| "routing caller went away"),
                (_, None) => Err("no response to deliver"),
                (None, _) => Err("reply already delivered"),
            },
        };
        match delivered {
            Ok(()) => true,
            Err(cause) => ctx.fail(TxStage::Respond, cause),
        }
    }

    fn describe(&self) -> String {
        let ctx = self.request.ctx();
        format!(
            "{} {} {} to {}",
            self.request.protocol(),
            ctx.purpose.as_str(),
            ctx.primitive.request_id(),
            ctx.endpoint
        )
    }
}

async fn exchange(
    request: &mut TxRequest,
    client: &TransportClient,
    timeout: Option<std::time::Duration>,
) -> Result<(), ClientError> {
    let missing = || ClientError::InvalidTarget("request was not translated".into());
    match (request, client) {
        (TxRequest::Http(tx), TransportClient::Http(http)) => {
            let wire = tx.wire.take().ok_or_else(missing)?;
            let reply = http.send(&tx.ctx.endpoint, wire).await?;
            tx.reply = Some(reply);
        }
        (TxRequest::Coap(tx), TransportClient::Coap(coap)) => {
            let wire = tx.wire.take().ok_or_else(missing)?;
            if tx.ctx.is_notification() {
                coap.send(&tx.ctx.endpoint, wire).await?;
            } else {
                let reply = coap.request(&tx.ctx.endpoint, wire).await?;
                tx.reply = Some(reply);
            }
        }
        (TxRequest::Mqtt(tx), TransportClient::Mqtt(mqtt)) => {
            let wire = tx.wire.take().ok_or_else(missing)?;
            match &wire.response_filter {
                None => mqtt.publish(&wire.topic, wire.payload).await?,
                Some(filter) => {
                    let reply = mqtt
                        .request(
                            &wire.topic,
                            tx.ctx.primitive.request_id(),
                            wire.payload,
                            filter,
                            timeout,
                        )
                        .await?;
                    tx.reply = Some(reply);
                }
            }
        }
        (request, client) => {
            return Err(ClientError::InvalidTarget(format!(
                "{} request handed to {} client",
                request.protocol(),
                client.protocol()
            )))
        }
    }
    Ok(())
}

fn method_for(operation: Operation) -> Method {
    match operation {
        Operation::Create | Operation::Notify => Method::POST,
        Operation::Retrieve => Method::GET,
        Operation::Update => Method::PUT,
        Operation::Delete => Method::DELETE,
    }
}

/// Query parameters of a routed request.
fn route_query(primitive: &RequestPrimitive) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(rcn) = primitive.result_content() {
        params.push(("rcn", rcn.code().to_string()));
    }
    let filter = primitive.filter();
    match filter.filter_usage {
        Some(FilterUsage::Discovery) => params.push(("fu", "1".to_string())),
        Some(FilterUsage::ConditionalRetrieval) => params.push(("fu", "2".to_string())),
        None => {}
    }
    for ty in &filter.resource_types {
        params.push(("rty", ty.code().to_string()));
    }
    if let Some(limit) = filter.limit {
        params.push(("lim", limit.to_string()));
    }
    for label in &filter.labels {
        params.push(("lbl", label.clone()));
    }
    params
}

/// Request path of a routed request: the endpoint's base path joined with
/// the protocol form of the target address.
fn route_path(ctx: &TxContext) -> String {
    let base = ctx.endpoint.path.trim_end_matches('/');
    format!("{}{}", base, uri::to_protocol(ctx.primitive.to()))
}

fn payload_bytes(primitive: &RequestPrimitive) -> Result<Vec<u8>, ClientError> {
    match primitive.content() {
        Some(content) => Ok(serde_json::to_vec(content)?),
        None => Ok(Vec::new()),
    }
}

fn http_request(ctx: &TxContext) -> Result<Request<Full<Bytes>>, ClientError> {
    let primitive = &ctx.primitive;
    let authority = ctx
        .endpoint
        .authority()
        .ok_or_else(|| ClientError::InvalidTarget(ctx.endpoint.to_string()))?;

    let (path, content_type) = if ctx.is_notification() {
        (ctx.endpoint.path_and_query(), content_type::NTFY_JSON.to_string())
    } else {
        let path = route_path(ctx);
        let query: Vec<String> = route_query(primitive)
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let path = if query.is_empty() {
            path
        } else {
            format!("{}?{}", path, query.join("&"))
        };
        let content_type = match primitive.resource_type() {
            Some(ty) if primitive.operation() == Operation::Create => {
                format!("{};ty={}", content_type::RES_JSON, ty.code())
            }
            _ => content_type::RES_JSON.to_string(),
        };
        (path, content_type)
    };

    let mut builder = Request::builder()
        .method(method_for(primitive.operation()))
        .uri(path)
        .header(HOST, authority)
        .header(header::REQUEST_ID, primitive.request_id())
        .header(ACCEPT, content_type::RES_JSON);
    if let Some(from) = primitive.from() {
        builder = builder.header(header::ORIGIN, from);
    }
    if let Some(ot) = primitive.originating_timestamp() {
        builder = builder.header(header::ORIGINATING_TIMESTAMP, ot);
    }
    if let Some(name) = primitive.name() {
        builder = builder.header(header::NAME, name);
    }

    let body = payload_bytes(primitive)?;
    if !body.is_empty() {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| ClientError::Http(e.to_string()))
}

fn coap_request(ctx: &TxContext) -> Result<CoapMessage, ClientError> {
    let primitive = &ctx.primitive;
    let (message_type, code) = if ctx.is_notification() {
        (MessageType::NonConfirmable, CoapCode::POST)
    } else {
        let code = match primitive.operation() {
            Operation::Create | Operation::Notify => CoapCode::POST,
            Operation::Retrieve => CoapCode::GET,
            Operation::Update => CoapCode::PUT,
            Operation::Delete => CoapCode::DELETE,
        };
        (MessageType::Confirmable, code)
    };
    let mut message = CoapMessage::new(message_type, code, 0);

    if ctx.is_notification() {
        message.set_uri_path(&ctx.endpoint.path);
        if let Some(query) = &ctx.endpoint.query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                message.add_string_option(option::URI_QUERY, pair);
            }
        }
    } else {
        message.set_uri_path(&route_path(ctx));
        for (key, value) in route_query(primitive) {
            message.add_string_option(option::URI_QUERY, &format!("{}={}", key, value));
        }
    }

    let format = if ctx.is_notification() {
        content_type::COAP_NTFY_JSON
    } else {
        content_type::COAP_RES_JSON
    };
    let body = payload_bytes(primitive)?;
    if !body.is_empty() {
        message.add_uint_option(option::CONTENT_FORMAT, u32::from(format));
    }
    if let Some(from) = primitive.from() {
        message.add_string_option(option::ONEM2M_FR, from);
    }
    message.add_string_option(option::ONEM2M_RQI, primitive.request_id());
    if let Some(name) = primitive.name() {
        message.add_string_option(option::ONEM2M_NM, name);
    }
    if let Some(ot) = primitive.originating_timestamp() {
        message.add_string_option(option::ONEM2M_OT, ot);
    }
    if let (Operation::Create, Some(ty)) = (primitive.operation(), primitive.resource_type()) {
        message.add_uint_option(option::ONEM2M_TY, u32::from(ty.code()));
    }
    Ok(message.with_payload(body))
}

fn mqtt_request(ctx: &TxContext) -> Result<MqttWire, ClientError> {
    let primitive = &ctx.primitive;
    if ctx.is_notification() {
        let payload = notification_payload(ctx);
        return Ok(MqttWire {
            topic: ctx.endpoint.path.clone(),
            payload: serde_json::to_vec(&payload)?,
            response_filter: None,
        });
    }

    let remote = Address::parse(primitive.to())?
        .cse_id()
        .map(str::to_string)
        .ok_or_else(|| {
            ClientError::InvalidTarget(format!(
                "{} does not name a remote CSE",
                primitive.to()
            ))
        })?;
    Ok(MqttWire {
        topic: format!("{}{}/{}/json", REQUEST_TOPIC_PREFIX, ctx.sender, remote),
        payload: serde_json::to_vec(&JsonRequest::from_primitive(primitive))?,
        response_filter: Some(format!("{}{}/+/json", RESPONSE_TOPIC_PREFIX, ctx.sender)),
    })
}

/// JSON request primitive carrying a notification. A payload that already
/// is a request primitive is completed in place; anything else becomes its
/// `pc`.
fn notification_payload(ctx: &TxContext) -> Value {
    let primitive = &ctx.primitive;
    let content = primitive.content().cloned().unwrap_or(Value::Null);
    let mut payload = match content {
        Value::Object(map) if map.contains_key("op") => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("pc".to_string(), other);
            map
        }
    };
    payload
        .entry("op")
        .or_insert_with(|| Value::from(Operation::Notify.code()));
    payload
        .entry("to")
        .or_insert_with(|| Value::from(ctx.endpoint.to_string()));
    payload
        .entry("fr")
        .or_insert_with(|| Value::from(ctx.sender.clone()));
    payload
        .entry("rqi")
        .or_insert_with(|| Value::from(primitive.request_id()));
    Value::Object(payload)
}

fn json_content(body: &[u8]) -> Result<Option<Value>, ClientError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

fn http_response(
    ctx: &TxContext,
    reply: Option<Response<Bytes>>,
) -> Result<Option<ResponsePrimitive>, ClientError> {
    let reply = reply.ok_or(ClientError::ConnectionClosed)?;
    let status = reply.status();
    if ctx.is_notification() {
        if !status.is_success() {
            return Err(ClientError::Http(format!(
                "notification rejected with {}",
                status
            )));
        }
        return Ok(None);
    }

    let headers = reply.headers();
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let rsc = text(header::RESPONSE_STATUS_CODE)
        .and_then(|value| value.trim().parse::<u16>().ok())
        .and_then(ResponseStatusCode::from_code)
        .unwrap_or_else(|| ResponseStatusCode::from_http_status(status.as_u16()));
    let request_id =
        text(header::REQUEST_ID).unwrap_or_else(|| ctx.primitive.request_id().to_string());

    let mut response = ResponsePrimitive::new(rsc, request_id);
    if let Some(content) = json_content(reply.body())? {
        response = response.with_content(content);
    }
    if let Some(location) = text(CONTENT_LOCATION.as_str()) {
        response = response.with_content_location(uri::to_canonical(&location));
    }
    Ok(Some(response))
}

fn coap_response(
    ctx: &TxContext,
    reply: Option<CoapMessage>,
) -> Result<Option<ResponsePrimitive>, ClientError> {
    if ctx.is_notification() {
        return Ok(None);
    }
    let reply = reply.ok_or(ClientError::ConnectionClosed)?;
    let rsc = reply
        .uint_option(option::ONEM2M_RSC)?
        .and_then(|code| u16::try_from(code).ok())
        .and_then(ResponseStatusCode::from_code)
        .unwrap_or_else(|| ResponseStatusCode::from_coap_code(reply.code));
    let request_id = reply
        .string_option(option::ONEM2M_RQI)?
        .unwrap_or_else(|| ctx.primitive.request_id().to_string());

    let mut response = ResponsePrimitive::new(rsc, request_id);
    if let Some(content) = json_content(&reply.payload)? {
        response = response.with_content(content);
    }
    let location: Vec<String> = reply
        .option_values(option::LOCATION_PATH)
        .filter_map(|value| std::str::from_utf8(value).ok())
        .map(str::to_string)
        .collect();
    if !location.is_empty() {
        response =
            response.with_content_location(uri::to_canonical(&format!("/{}", location.join("/"))));
    }
    Ok(Some(response))
}

fn mqtt_response(
    ctx: &TxContext,
    reply: Option<JsonResponse>,
) -> Result<Option<ResponsePrimitive>, ClientError> {
    if ctx.is_notification() {
        return Ok(None);
    }
    let reply = reply.ok_or(ClientError::ConnectionClosed)?;
    Ok(Some(reply.into_primitive()?))
}
