//! Rx pipeline.
//!
//! Every inbound message runs through the same six stages, in order:
//!
//! ```text
//! Receive -> AuthorizeTransport -> Resolve -> Execute -> Format -> Respond
//! ```
//!
//! A stage failure short-circuits the rest; the error is classified into a
//! status code and answered like any other response. Nothing is retried.

use crate::adapter::{Adapters, Inbound, Outbound};
use crate::config::CseConfig;
use crate::events::{EventBroadcaster, EventKind, ResourceEvent};
use crate::metrics::Metrics;
use iotdm_client::Router;
use iotdm_core::{ChildFilter, NewResource, ResourceId, ResourceNode, ResourcePatch, ResourceStore, StoreError};
use iotdm_protocol::uri::Address;
use iotdm_protocol::{
    m2m_timestamp, FilterCriteria, GatewayError, Operation, Protocol, RequestPrimitive,
    ResourceType, ResponsePrimitive, ResponseStatusCode, ResultContent, SecurityLevel,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Attributes the gateway maintains itself; ignored in request content.
const GENERATED_ATTRIBUTES: &[&str] = &["ri", "pi", "rn", "ty", "ct", "lt"];

/// Rx pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStage {
    Receive,
    AuthorizeTransport,
    Resolve,
    Execute,
    Format,
    Respond,
}

impl RxStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RxStage::Receive => "receive",
            RxStage::AuthorizeTransport => "authorize_transport",
            RxStage::Resolve => "resolve",
            RxStage::Execute => "execute",
            RxStage::Format => "format",
            RxStage::Respond => "respond",
        }
    }
}

impl fmt::Display for RxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a request's target lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// A resource of the local tree and its hierarchical address.
    Local { node: ResourceNode, address: String },
    /// A remote CSE reachable through `next_hop`.
    Remote { cse_id: String, next_hop: String },
}

/// What Execute produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The target (or created) resource.
    Resource { node: ResourceNode, address: String },
    /// Discovery result, as hierarchical addresses.
    Discovered(Vec<String>),
    /// Response of a remote CSE.
    Forwarded(ResponsePrimitive),
    /// Nothing to return.
    Acknowledged,
}

/// Result of the Execute stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub status: ResponseStatusCode,
    pub outcome: Outcome,
    /// Event to publish once the operation has taken effect.
    pub event: Option<ResourceEvent>,
    /// `Content-Location` of a created resource.
    pub location: Option<String>,
}

impl Executed {
    fn new(status: ResponseStatusCode, outcome: Outcome) -> Self {
        Self {
            status,
            outcome,
            event: None,
            location: None,
        }
    }

    fn with_event(mut self, event: ResourceEvent) -> Self {
        self.event = Some(event);
        self
    }
}

/// Request handling shared by all transport servers.
pub struct RxPipeline {
    store: Arc<dyn ResourceStore>,
    adapters: Adapters,
    cse: CseConfig,
    /// Minimum security level per transport (default L0).
    levels: HashMap<Protocol, SecurityLevel>,
    router: Option<Arc<Router>>,
    events: Option<Arc<EventBroadcaster>>,
    metrics: Option<Arc<Metrics>>,
}

impl RxPipeline {
    pub fn new(store: Arc<dyn ResourceStore>, cse: CseConfig) -> Self {
        Self {
            store,
            adapters: Adapters::new(cse.cse_id.clone()),
            cse,
            levels: HashMap::new(),
            router: None,
            events: None,
            metrics: None,
        }
    }

    pub fn with_min_level(mut self, protocol: Protocol, level: SecurityLevel) -> Self {
        self.levels.insert(protocol, level);
        self
    }

    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn adapters(&self) -> &Adapters {
        &self.adapters
    }

    pub fn cse(&self) -> &CseConfig {
        &self.cse
    }

    /// Creates the cseBase unless it already exists and returns its id.
    pub fn provision_cse_base(&self) -> Result<ResourceId, StoreError> {
        match self.store.get_by_name(None, &self.cse.name) {
            Ok(node) => Ok(node.id),
            Err(StoreError::NotFound { .. }) => {
                let content = json!({ "csi": self.cse.cse_id, "cst": 1 });
                let id = self.store.create_root(
                    NewResource::new(ResourceType::CseBase, content).with_name(self.cse.name.clone()),
                )?;
                tracing::info!("Provisioned cseBase {} ({})", self.cse.name, id);
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the full pipeline and returns the native response.
    pub async fn process(&self, inbound: &Inbound) -> Outbound {
        let response = self.handle(inbound).await;
        self.respond(inbound, &response)
    }

    /// Runs Receive through Format. Always yields a response.
    pub async fn handle(&self, inbound: &Inbound) -> ResponsePrimitive {
        let protocol = inbound.protocol();
        let started = Instant::now();

        let (operation, response) = match self.receive(inbound) {
            Ok(request) => {
                let response = match self.run_stages(inbound, &request).await {
                    Ok(response) => response,
                    Err((stage, err)) => self.failure(inbound, stage, &err, Some(&request)),
                };
                let response = match request.from() {
                    Some(originator) if response.to.is_none() => response.with_to(originator),
                    _ => response,
                };
                (request.operation().as_str(), response)
            }
            Err(err) => ("unknown", self.failure(inbound, RxStage::Receive, &err, None)),
        };
        let response = if response.from.is_none() {
            response.with_from(self.cse.cse_id.clone())
        } else {
            response
        };

        tracing::debug!(
            "{} {} -> {} ({})",
            protocol,
            operation,
            response.status.code(),
            response.request_id
        );
        if let Some(metrics) = &self.metrics {
            metrics
                .requests_total
                .with_label_values(&[protocol.as_str(), operation])
                .inc();
            metrics
                .responses_total
                .with_label_values(&[protocol.as_str(), &response.status.code().to_string()])
                .inc();
            metrics
                .request_duration
                .with_label_values(&[protocol.as_str()])
                .observe(started.elapsed().as_secs_f64());
        }
        response
    }

    async fn run_stages(
        &self,
        inbound: &Inbound,
        request: &RequestPrimitive,
    ) -> Result<ResponsePrimitive, (RxStage, GatewayError)> {
        self.authorize(inbound)
            .map_err(|e| (RxStage::AuthorizeTransport, e))?;
        let resolved = self.resolve(request).map_err(|e| (RxStage::Resolve, e))?;
        let executed = self
            .execute(request, resolved)
            .await
            .map_err(|e| (RxStage::Execute, e))?;
        if let (Some(events), Some(event)) = (&self.events, &executed.event) {
            events.publish(event.clone());
        }
        self.format(request, executed).map_err(|e| (RxStage::Format, e))
    }

    fn failure(
        &self,
        inbound: &Inbound,
        stage: RxStage,
        err: &GatewayError,
        request: Option<&RequestPrimitive>,
    ) -> ResponsePrimitive {
        let request_id = request
            .map(|r| r.request_id().to_string())
            .or_else(|| self.adapters.request_id(inbound))
            .unwrap_or_default();
        tracing::debug!(
            "{} request {} stopped at {}: {}",
            inbound.protocol(),
            request_id,
            stage,
            err
        );
        ResponsePrimitive::from_error(err, request_id)
    }

    /// Receive: native message to canonical request.
    pub fn receive(&self, inbound: &Inbound) -> Result<RequestPrimitive, GatewayError> {
        self.adapters.parse_request(inbound)
    }

    /// AuthorizeTransport: the negotiated level must reach the configured one.
    pub fn authorize(&self, inbound: &Inbound) -> Result<(), GatewayError> {
        let protocol = inbound.protocol();
        let required = self
            .levels
            .get(&protocol)
            .copied()
            .unwrap_or(SecurityLevel::L0);
        let negotiated = self.adapters.negotiated_level(inbound);
        if negotiated < required {
            return Err(GatewayError::Forbidden(format!(
                "{} requires security level {}, connection offers {}",
                protocol, required, negotiated
            )));
        }
        Ok(())
    }

    /// Resolve: target address to a local resource or a remote CSE.
    pub fn resolve(&self, request: &RequestPrimitive) -> Result<Resolved, GatewayError> {
        let address = Address::parse(request.to())?;
        if let Some(cse_id) = address.cse_id() {
            if cse_id != self.local_cse_id() {
                return match self.cse.routes.get(cse_id) {
                    Some(next_hop) => Ok(Resolved::Remote {
                        cse_id: cse_id.to_string(),
                        next_hop: next_hop.clone(),
                    }),
                    None => Err(GatewayError::NotFound(format!("unknown CSE {}", cse_id))),
                };
            }
        }
        self.resolve_local(address.path())
    }

    fn local_cse_id(&self) -> &str {
        self.cse.cse_id.trim_start_matches('/')
    }

    fn resolve_local(&self, path: &[String]) -> Result<Resolved, GatewayError> {
        let root = self.store.get_by_name(None, &self.cse.name)?;
        let Some((first, rest)) = path.split_first() else {
            return Ok(Resolved::Local {
                node: root,
                address: self.cse.name.clone(),
            });
        };

        if *first == self.cse.name {
            let mut node = root;
            let mut address = self.cse.name.clone();
            for segment in rest {
                node = self.store.get_by_name(Some(&node.id), segment)?;
                address.push('/');
                address.push_str(segment);
            }
            return Ok(Resolved::Local { node, address });
        }

        // unstructured resource id
        if rest.is_empty() {
            let node = self.store.get(first)?;
            let address = hierarchical_address(self.store.as_ref(), &node)?;
            return Ok(Resolved::Local { node, address });
        }
        Err(GatewayError::NotFound(format!("{} not found", path.join("/"))))
    }

    /// Execute: apply the operation.
    pub async fn execute(
        &self,
        request: &RequestPrimitive,
        resolved: Resolved,
    ) -> Result<Executed, GatewayError> {
        let (node, address) = match resolved {
            Resolved::Remote { cse_id, next_hop } => {
                return self.forward(request, &cse_id, &next_hop).await
            }
            Resolved::Local { node, address } => (node, address),
        };

        match request.operation() {
            Operation::Create => self.create(request, node, address),
            Operation::Retrieve if request.is_discovery() => {
                let uris = self.discover(&node, &address, request.filter())?;
                Ok(Executed::new(ResponseStatusCode::Ok, Outcome::Discovered(uris)))
            }
            Operation::Retrieve => Ok(Executed::new(
                ResponseStatusCode::Ok,
                Outcome::Resource { node, address },
            )),
            Operation::Update => self.update(request, node, address),
            Operation::Delete => self.delete(node, address),
            Operation::Notify => Ok(Executed::new(ResponseStatusCode::Ok, Outcome::Acknowledged)),
        }
    }

    async fn forward(
        &self,
        request: &RequestPrimitive,
        cse_id: &str,
        next_hop: &str,
    ) -> Result<Executed, GatewayError> {
        let router = self.router.as_ref().ok_or_else(|| {
            GatewayError::TransportSendFailure(format!("no route to {}", cse_id))
        })?;
        tracing::debug!("Forwarding {} to {} via {}", request.request_id(), cse_id, next_hop);

        let result = router.route(request.clone(), next_hop).await;
        if let Some(metrics) = &self.metrics {
            let label = if result.is_ok() { "ok" } else { "failed" };
            metrics.routed_requests_total.with_label_values(&[label]).inc();
        }
        let response = result?;
        Ok(Executed::new(response.status, Outcome::Forwarded(response)))
    }

    fn create(
        &self,
        request: &RequestPrimitive,
        parent: ResourceNode,
        parent_address: String,
    ) -> Result<Executed, GatewayError> {
        let resource_type = request
            .resource_type()
            .ok_or_else(|| GatewayError::BadRequest("resource type is missing".into()))?;
        if !resource_type.is_creatable() {
            return Err(GatewayError::BadRequest(format!(
                "{} resources cannot be created",
                resource_type.short_name()
            )));
        }

        let mut attributes = unwrap_content(request.content(), resource_type)?;
        let content_name = attributes
            .remove("rn")
            .and_then(|rn| rn.as_str().map(str::to_string));
        strip_generated(&mut attributes);
        let name = request.name().map(str::to_string).or(content_name);

        let mut resource = NewResource::new(resource_type, Value::Object(attributes));
        if let Some(name) = name {
            resource = resource.with_name(name);
        }
        let id = self.store.create(&parent.id, resource)?;
        let node = self.store.get(&id)?;
        let address = format!("{}/{}", parent_address, node.name);

        let event = ResourceEvent {
            kind: EventKind::ChildCreated,
            subject_id: parent.id,
            subject_address: parent_address,
            representation: wrapped_attributes(&node),
        };
        let mut executed = Executed::new(
            ResponseStatusCode::Created,
            Outcome::Resource {
                node,
                address: address.clone(),
            },
        )
        .with_event(event);
        executed.location = Some(address);
        Ok(executed)
    }

    fn update(
        &self,
        request: &RequestPrimitive,
        node: ResourceNode,
        address: String,
    ) -> Result<Executed, GatewayError> {
        if request.content().is_none() {
            return Err(GatewayError::BadRequest("update without content".into()));
        }
        let mut attributes = unwrap_content(request.content(), node.resource_type)?;
        strip_generated(&mut attributes);

        let patch = ResourcePatch::new(Value::Object(attributes)).with_expected_revision(node.revision);
        let updated = self.store.update(&node.id, patch)?;
        let event = ResourceEvent {
            kind: EventKind::Updated,
            subject_id: updated.id.clone(),
            subject_address: address.clone(),
            representation: wrapped_attributes(&updated),
        };
        Ok(Executed::new(
            ResponseStatusCode::Updated,
            Outcome::Resource {
                node: updated,
                address,
            },
        )
        .with_event(event))
    }

    fn delete(&self, node: ResourceNode, address: String) -> Result<Executed, GatewayError> {
        let Some(parent_id) = node.parent_id.clone() else {
            return Err(GatewayError::BadRequest(format!(
                "{} cannot be deleted",
                address
            )));
        };
        self.store.delete(&node.id)?;

        let parent_address = address
            .rsplit_once('/')
            .map_or_else(|| self.cse.name.clone(), |(parent, _)| parent.to_string());
        let event = ResourceEvent {
            kind: EventKind::ChildDeleted,
            subject_id: parent_id,
            subject_address: parent_address,
            representation: wrapped_attributes(&node),
        };
        Ok(Executed::new(ResponseStatusCode::Deleted, Outcome::Resource { node, address })
            .with_event(event))
    }

    /// Descendants of `node` matching the filter, depth first, in child order.
    fn discover(
        &self,
        node: &ResourceNode,
        address: &str,
        filter: &FilterCriteria,
    ) -> Result<Vec<String>, GatewayError> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        self.collect_matches(&node.id, address, filter, limit, &mut found)?;
        Ok(found)
    }

    fn collect_matches(
        &self,
        id: &str,
        base: &str,
        filter: &FilterCriteria,
        limit: usize,
        found: &mut Vec<String>,
    ) -> Result<(), GatewayError> {
        let children = match self.store.list_children(id, ChildFilter::default()) {
            Ok(children) => children,
            // removed while walking
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for child in children.iter() {
            if found.len() >= limit {
                break;
            }
            let child = child?;
            let address = format!("{}/{}", base, child.name);
            if discovery_matches(filter, &child) {
                found.push(address.clone());
            }
            self.collect_matches(&child.id, &address, filter, limit, found)?;
        }
        Ok(())
    }

    /// Format: build the response primitive from the execution result.
    pub fn format(
        &self,
        request: &RequestPrimitive,
        executed: Executed,
    ) -> Result<ResponsePrimitive, GatewayError> {
        let mut response = match executed.outcome {
            Outcome::Forwarded(mut remote) => {
                remote.request_id = request.request_id().to_string();
                remote
            }
            Outcome::Acknowledged => ResponsePrimitive::new(executed.status, request.request_id()),
            Outcome::Discovered(uris) => ResponsePrimitive::new(executed.status, request.request_id())
                .with_content(json!({ "m2m:uril": uris })),
            Outcome::Resource { node, address } => {
                let result_content = request.result_content().unwrap_or(
                    if request.operation() == Operation::Delete {
                        ResultContent::Nothing
                    } else {
                        ResultContent::Attributes
                    },
                );
                let response = ResponsePrimitive::new(executed.status, request.request_id());
                match self.representation(&node, &address, result_content)? {
                    Some(content) => response.with_content(content),
                    None => response,
                }
            }
        };
        if let Some(location) = executed.location {
            response = response.with_content_location(location);
        }
        Ok(response)
    }

    fn representation(
        &self,
        node: &ResourceNode,
        address: &str,
        result_content: ResultContent,
    ) -> Result<Option<Value>, GatewayError> {
        let content = match result_content {
            ResultContent::Nothing => return Ok(None),
            ResultContent::Attributes => wrapped_attributes(node),
            ResultContent::HierarchicalAddress => json!({ "m2m:uri": address }),
            ResultContent::HierarchicalAddressAndAttributes => json!({
                "m2m:rce": {
                    "uri": address,
                    wrapper_key(node.resource_type): attributes(node),
                }
            }),
            ResultContent::AttributesAndChildResources => {
                let mut attrs = attributes(node);
                for child in self.children(node)? {
                    let entry = attrs
                        .entry(wrapper_key(child.resource_type))
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(list) = entry {
                        list.push(Value::Object(attributes(&child)));
                    }
                }
                wrap(node.resource_type, attrs)
            }
            ResultContent::AttributesAndChildReferences => {
                let mut attrs = attributes(node);
                attrs.insert("ch".to_string(), self.child_references(node, address)?);
                wrap(node.resource_type, attrs)
            }
            ResultContent::ChildReferences => json!({
                "m2m:rrl": { "rrf": self.child_references(node, address)? }
            }),
        };
        Ok(Some(content))
    }

    /// Children of a node; a node deleted meanwhile has none.
    fn children(&self, node: &ResourceNode) -> Result<Vec<ResourceNode>, GatewayError> {
        match self.store.list_children(&node.id, ChildFilter::default()) {
            Ok(children) => Ok(children.iter().collect::<Result<Vec<_>, _>>()?),
            Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn child_references(&self, node: &ResourceNode, address: &str) -> Result<Value, GatewayError> {
        let references = self
            .children(node)?
            .into_iter()
            .map(|child| {
                json!({
                    "nm": child.name,
                    "typ": child.resource_type.code(),
                    "val": format!("{}/{}", address, child.name),
                })
            })
            .collect();
        Ok(Value::Array(references))
    }

    /// Respond: canonical response back to the native one.
    pub fn respond(&self, inbound: &Inbound, response: &ResponsePrimitive) -> Outbound {
        self.adapters.format_response(inbound, response)
    }
}

/// Hierarchical address of a node, built by walking up to its root.
pub(crate) fn hierarchical_address(
    store: &dyn ResourceStore,
    node: &ResourceNode,
) -> Result<String, GatewayError> {
    let mut segments = vec![node.name.clone()];
    let mut parent_id = node.parent_id.clone();
    while let Some(id) = parent_id {
        let parent = store.get(&id)?;
        segments.push(parent.name);
        parent_id = parent.parent_id;
    }
    segments.reverse();
    Ok(segments.join("/"))
}

fn discovery_matches(filter: &FilterCriteria, node: &ResourceNode) -> bool {
    let labels = node.labels();
    (filter.resource_types.is_empty() || filter.resource_types.contains(&node.resource_type))
        && filter.labels.iter().all(|l| labels.contains(&l.as_str()))
}

fn wrapper_key(resource_type: ResourceType) -> String {
    format!("m2m:{}", resource_type.short_name())
}

fn wrap(resource_type: ResourceType, attributes: Map<String, Value>) -> Value {
    let mut wrapped = Map::new();
    wrapped.insert(wrapper_key(resource_type), Value::Object(attributes));
    Value::Object(wrapped)
}

/// Stored attributes plus the ones the gateway maintains.
fn attributes(node: &ResourceNode) -> Map<String, Value> {
    let mut attrs = node.content.as_object().cloned().unwrap_or_default();
    attrs.insert("ri".to_string(), json!(node.id));
    if let Some(parent_id) = &node.parent_id {
        attrs.insert("pi".to_string(), json!(parent_id));
    }
    attrs.insert("rn".to_string(), json!(node.name));
    attrs.insert("ty".to_string(), json!(node.resource_type.code()));
    attrs.insert("ct".to_string(), json!(m2m_timestamp(node.created_at)));
    attrs.insert("lt".to_string(), json!(m2m_timestamp(node.modified_at)));
    attrs
}

fn wrapped_attributes(node: &ResourceNode) -> Value {
    wrap(node.resource_type, attributes(node))
}

/// Attributes inside the `m2m:<type>` wrapper of request content.
fn unwrap_content(
    content: Option<&Value>,
    resource_type: ResourceType,
) -> Result<Map<String, Value>, GatewayError> {
    let Some(content) = content else {
        return Ok(Map::new());
    };
    let key = wrapper_key(resource_type);
    let object = content
        .as_object()
        .ok_or_else(|| GatewayError::BadRequest("content must be a JSON object".into()))?;
    match object.get(&key) {
        Some(Value::Object(inner)) if object.len() == 1 => Ok(inner.clone()),
        Some(_) => Err(GatewayError::BadRequest(format!(
            "{} must be the only key and hold an object",
            key
        ))),
        None => Err(GatewayError::BadRequest(format!(
            "content must be wrapped in {}",
            key
        ))),
    }
}

fn strip_generated(attributes: &mut Map<String, Value>) {
    for key in GENERATED_ATTRIBUTES {
        attributes.remove(*key);
    }
}
