//! Resource events and subscription notifications.
//!
//! The Rx pipeline publishes a [`ResourceEvent`] after every successful
//! create, update and delete. The [`NotificationDispatcher`] turns each
//! event into one notification per `nu` entry of the subscriptions under
//! the affected resource.

use crate::metrics::Metrics;
use dashmap::DashMap;
use iotdm_client::{NotificationTarget, Notifier, TxOutcome};
use iotdm_core::{ChildFilter, ResourceId, ResourceNode, ResourceStore};
use iotdm_protocol::ResourceType;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What happened to the subject resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Updated,
    ChildCreated,
    ChildDeleted,
}

impl EventKind {
    /// Notification event type (`net`).
    pub fn code(&self) -> u8 {
        match self {
            EventKind::Updated => 1,
            EventKind::ChildCreated => 3,
            EventKind::ChildDeleted => 4,
        }
    }
}

/// Change to a resource whose subscriptions must be notified.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub subject_id: ResourceId,
    /// Hierarchical address of the subject.
    pub subject_address: String,
    /// Representation carried in the notification (`rep`).
    pub representation: Value,
}

/// Fans resource events out to listeners.
pub struct EventBroadcaster {
    /// Per-resource channels.
    channels: DashMap<ResourceId, broadcast::Sender<ResourceEvent>>,
    /// Every event, used by the notification dispatcher.
    global_sender: broadcast::Sender<ResourceEvent>,
    channel_capacity: usize,
}

impl EventBroadcaster {
    pub fn new(channel_capacity: usize) -> Self {
        let (global_sender, _) = broadcast::channel(channel_capacity);
        Self {
            channels: DashMap::new(),
            global_sender,
            channel_capacity,
        }
    }

    /// Receives every event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ResourceEvent> {
        self.global_sender.subscribe()
    }

    /// Receives events about one resource.
    pub fn subscribe_resource(&self, resource_id: &str) -> broadcast::Receiver<ResourceEvent> {
        self.channels
            .entry(resource_id.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    pub fn publish(&self, event: ResourceEvent) {
        tracing::trace!(
            "Resource event net={} on {}",
            event.kind.code(),
            event.subject_address
        );
        if let Some(sender) = self.channels.get(&event.subject_id) {
            // no receivers is fine
            let _ = sender.send(event.clone());
        }
        let _ = self.global_sender.send(event);
    }

    /// Drops per-resource channels nobody listens to anymore.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Builds the `m2m:sgn` notification for one subscription.
pub fn notification_payload(event: &ResourceEvent, subscription_address: &str) -> Value {
    json!({
        "m2m:sgn": {
            "nev": {
                "rep": event.representation,
                "net": event.kind.code(),
            },
            "sur": subscription_address,
        }
    })
}

/// Notification URIs (`nu`) of a subscription.
fn notification_uris(subscription: &ResourceNode) -> Vec<String> {
    match subscription.attribute("nu") {
        Some(Value::Array(uris)) => uris
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(uri)) => vec![uri.clone()],
        _ => Vec::new(),
    }
}

/// Delivers subscription notifications for resource events.
pub struct NotificationDispatcher {
    store: Arc<dyn ResourceStore>,
    notifier: Arc<Notifier>,
    /// CSE-ID sent as originator.
    sender: String,
    metrics: Option<Arc<Metrics>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        notifier: Arc<Notifier>,
        sender: impl Into<String>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            store,
            notifier,
            sender: sender.into(),
            metrics: None,
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Notification targets for an event, one per subscription `nu` entry.
    pub fn targets(&self, event: &ResourceEvent) -> Vec<NotificationTarget> {
        let children = match self
            .store
            .list_children(&event.subject_id, ChildFilter::of_type(ResourceType::Subscription))
        {
            Ok(children) => children,
            Err(e) => {
                tracing::debug!("No subscriptions for {}: {}", event.subject_address, e);
                return Vec::new();
            }
        };

        let mut targets = Vec::new();
        for subscription in children.iter() {
            let subscription = match subscription {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!("Skipping subscription under {}: {}", event.subject_address, e);
                    continue;
                }
            };
            let address = format!("{}/{}", event.subject_address, subscription.name);
            let payload = notification_payload(event, &address);
            for uri in notification_uris(&subscription) {
                targets.push(NotificationTarget::new(uri, payload.clone(), self.sender.clone()));
            }
        }
        targets
    }

    /// Spawns one send per notification target of `event` into `tasks`.
    fn spawn_notifications(&self, event: &ResourceEvent, tasks: &mut JoinSet<TxOutcome>) -> usize {
        let targets = self.targets(event);
        if targets.is_empty() {
            return 0;
        }
        tracing::debug!(
            "Dispatching {} notification(s) for {}",
            targets.len(),
            event.subject_address
        );
        let count = targets.len();
        for target in targets {
            tasks.spawn(send_notification(
                Arc::clone(&self.notifier),
                self.metrics.clone(),
                target,
            ));
        }
        count
    }

    /// Sends every notification for one event concurrently.
    pub async fn dispatch(&self, event: &ResourceEvent) -> Vec<TxOutcome> {
        let mut tasks = JoinSet::new();
        if self.spawn_notifications(event, &mut tasks) == 0 {
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!("Notification task failed: {}", e),
            }
        }
        outcomes
    }

    /// Dispatches events until shutdown or until the channel closes.
    ///
    /// Notifications run as tasks owned by this loop, so a subscriber that
    /// never answers holds up only its own send.
    pub async fn run(&self, mut events: broadcast::Receiver<ResourceEvent>) {
        self.running.store(true, Ordering::SeqCst);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut in_flight: JoinSet<TxOutcome> = JoinSet::new();
        tracing::info!("Notification dispatcher started");

        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Ok(event) => {
                            self.spawn_notifications(&event, &mut in_flight);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!("Notification dispatcher lagged, {} event(s) dropped", missed);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Notification task failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::debug!("Cancelling {} pending notification(s)", in_flight.len());
        }
        in_flight.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Notification dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Sends one notification and counts its outcome.
async fn send_notification(
    notifier: Arc<Notifier>,
    metrics: Option<Arc<Metrics>>,
    target: NotificationTarget,
) -> TxOutcome {
    let protocol = target.protocol().map_or("unknown", |p| p.as_str());
    let outcome = notifier.notify(target).await;
    if let Some(metrics) = metrics {
        let result = if outcome.success { "sent" } else { "failed" };
        metrics
            .notifications_total
            .with_label_values(&[protocol, result])
            .inc();
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotdm_client::{ClientPool, PoolSettings};
    use iotdm_core::{MemoryStore, NewResource};
    use iotdm_protocol::coap::{option, CoapMessage};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn store_with_subscription(nu: Value) -> (Arc<MemoryStore>, ResourceId) {
        let store = Arc::new(MemoryStore::new());
        let cb = store
            .create_root(NewResource::new(ResourceType::CseBase, json!({})).with_name("InCSE1"))
            .unwrap();
        let cnt = store
            .create(&cb, NewResource::new(ResourceType::Container, json!({})).with_name("cnt1"))
            .unwrap();
        store
            .create(
                &cnt,
                NewResource::new(ResourceType::Subscription, json!({ "nu": nu })).with_name("sub1"),
            )
            .unwrap();
        (store, cnt)
    }

    fn dispatcher(store: Arc<MemoryStore>) -> NotificationDispatcher {
        let pool = Arc::new(ClientPool::new(PoolSettings::default()));
        NotificationDispatcher::new(store, Arc::new(Notifier::new(pool)), "in-cse")
    }

    fn event(subject_id: &str) -> ResourceEvent {
        ResourceEvent {
            kind: EventKind::ChildCreated,
            subject_id: subject_id.to_string(),
            subject_address: "InCSE1/cnt1".to_string(),
            representation: json!({"m2m:cin": {"con": "21"}}),
        }
    }

    #[test]
    fn test_payload_shape() {
        let payload = notification_payload(&event("2"), "InCSE1/cnt1/sub1");
        assert_eq!(payload["m2m:sgn"]["nev"]["net"], 3);
        assert_eq!(payload["m2m:sgn"]["nev"]["rep"]["m2m:cin"]["con"], "21");
        assert_eq!(payload["m2m:sgn"]["sur"], "InCSE1/cnt1/sub1");
    }

    #[test]
    fn test_one_target_per_uri() {
        let (store, cnt) =
            store_with_subscription(json!(["http://127.0.0.1:9/a", "coap://127.0.0.1:9/b"]));
        let targets = dispatcher(store).targets(&event(&cnt));
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].url, "http://127.0.0.1:9/a");
        assert_eq!(targets[1].sender, "in-cse");
        assert_eq!(targets[1].payload["m2m:sgn"]["sur"], "InCSE1/cnt1/sub1");
    }

    #[test]
    fn test_no_subscriptions() {
        let (store, _) = store_with_subscription(json!([]));
        let d = dispatcher(store);
        assert!(d.targets(&event("999")).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_over_coap() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("coap://{}/notify", peer.local_addr().unwrap());
        let (store, cnt) = store_with_subscription(json!([url]));
        let d = dispatcher(store);

        let outcomes = d.dispatch(&event(&cnt)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);

        let mut buf = [0u8; 2048];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        let message = CoapMessage::decode(&buf[..n]).unwrap();
        assert_eq!(
            message.string_option(option::ONEM2M_FR).unwrap().as_deref(),
            Some("in-cse")
        );
        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["m2m:sgn"]["nev"]["net"], 3);
    }

    #[test]
    fn test_broadcaster_routes_by_resource() {
        let broadcaster = EventBroadcaster::default();
        let mut all = broadcaster.subscribe_all();
        let mut one = broadcaster.subscribe_resource("2");
        let mut other = broadcaster.subscribe_resource("3");

        broadcaster.publish(event("2"));
        assert_eq!(all.try_recv().unwrap().subject_id, "2");
        assert_eq!(one.try_recv().unwrap().kind, EventKind::ChildCreated);
        assert!(other.try_recv().is_err());

        drop(one);
        drop(other);
        broadcaster.prune();
        assert!(broadcaster.channels.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (store, _) = store_with_subscription(json!([]));
        let d = Arc::new(dispatcher(store));
        let broadcaster = EventBroadcaster::default();
        let events = broadcaster.subscribe_all();

        let runner = Arc::clone(&d);
        let handle = tokio::spawn(async move { runner.run(events).await });
        while !d.is_running() {
            tokio::task::yield_now().await;
        }
        d.shutdown();
        handle.await.unwrap();
        assert!(!d.is_running());
    }

    #[tokio::test]
    async fn test_unanswered_subscriber_does_not_delay_other_resources() {
        // Accepts HTTP connections and holds them without replying.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_url = format!("http://{}/notify", silent.local_addr().unwrap());
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = silent.accept().await {
                held.push(socket);
            }
        });
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let coap_url = format!("coap://{}/notify", peer.local_addr().unwrap());

        let store = Arc::new(MemoryStore::new());
        let cb = store
            .create_root(NewResource::new(ResourceType::CseBase, json!({})).with_name("InCSE1"))
            .unwrap();
        let mut containers = Vec::new();
        for (name, nu) in [("cntA", &silent_url), ("cntB", &coap_url)] {
            let cnt = store
                .create(&cb, NewResource::new(ResourceType::Container, json!({})).with_name(name))
                .unwrap();
            store
                .create(
                    &cnt,
                    NewResource::new(ResourceType::Subscription, json!({ "nu": [nu] }))
                        .with_name("sub1"),
                )
                .unwrap();
            containers.push(cnt);
        }

        let d = Arc::new(dispatcher(store));
        let broadcaster = EventBroadcaster::default();
        let events = broadcaster.subscribe_all();
        let runner = Arc::clone(&d);
        let handle = tokio::spawn(async move { runner.run(events).await });
        while !d.is_running() {
            tokio::task::yield_now().await;
        }

        let mut first = event(&containers[0]);
        first.subject_address = "InCSE1/cntA".into();
        let mut second = event(&containers[1]);
        second.subject_address = "InCSE1/cntB".into();
        broadcaster.publish(first);
        broadcaster.publish(second);

        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(3), peer.recv_from(&mut buf))
            .await
            .expect("notification for cntB was held back")
            .unwrap();
        let message = CoapMessage::decode(&buf[..n]).unwrap();
        let body: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(body["m2m:sgn"]["sur"], "InCSE1/cntB/sub1");

        d.shutdown();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
        assert!(!d.is_running());
        holder.abort();
    }
}
