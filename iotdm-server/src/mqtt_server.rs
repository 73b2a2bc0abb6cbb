//! MQTT binding: subscribes to request topics on a broker and publishes
//! responses.

use crate::adapter::{Inbound, MqttInbound, Outbound};
use crate::config::ServerSection;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::{Registration, TransportRegistry};
use crate::rx::RxPipeline;
use crate::server::{RegistrationGuard, ServerState, ServerStats, TransportServer};
use async_trait::async_trait;
use iotdm_client::{ClientError, MqttClient, MqttOptions, ProtocolClientConfig};
use iotdm_protocol::mqtt::Publish;
use iotdm_protocol::{Protocol, SecurityLevel};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_KEEP_ALIVE_SECS: u16 = 60;

/// How often the broker connection is checked.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Receives oneM2M requests published on `/oneM2M/req/+/<cse-id>/json`.
pub struct MqttServer {
    section: ServerSection,
    client_config: ProtocolClientConfig,
    client_id: String,
    keep_alive: u16,
    pipeline: Arc<RxPipeline>,
    registry: Arc<TransportRegistry>,
    state: ServerState,
}

impl MqttServer {
    /// `section` names the broker to connect to; `client_config` secures
    /// that connection.
    pub fn new(
        section: ServerSection,
        client_config: ProtocolClientConfig,
        pipeline: Arc<RxPipeline>,
        registry: Arc<TransportRegistry>,
    ) -> Self {
        let client_id = format!("{}-rx", pipeline.cse().cse_id.trim_start_matches('/'));
        Self {
            section,
            client_config,
            client_id,
            keep_alive: DEFAULT_KEEP_ALIVE_SECS,
            pipeline,
            registry,
            state: ServerState::new(Protocol::Mqtt),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> &ServerStats {
        &self.state.stats
    }

    fn options(&self) -> MqttOptions {
        let options = MqttOptions::new(
            self.section.host.clone(),
            self.section.port,
            self.client_id.clone(),
        )
        .with_keep_alive(self.keep_alive);
        if self.section.level >= SecurityLevel::L1 {
            options.with_tls()
        } else {
            options
        }
    }

    async fn handle_publish(
        client: Arc<MqttClient>,
        pipeline: Arc<RxPipeline>,
        stats: Arc<ServerStats>,
        publish: Publish,
        secure: bool,
    ) {
        stats.requests_total.fetch_add(1, Ordering::Relaxed);
        let inbound = Inbound::Mqtt(MqttInbound::new(publish.topic, publish.payload, secure));
        let reply = match pipeline.process(&inbound).await {
            Outbound::Mqtt(reply) => reply,
            other => {
                tracing::error!("MQTT request answered with a non-MQTT message: {:?}", other);
                return;
            }
        };
        if let Err(e) = client.publish(&reply.topic, reply.payload).await {
            tracing::warn!("cannot publish response on {}: {}", reply.topic, e);
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn serve(&self, client: &Arc<MqttClient>) -> Result<(), ServerError> {
        // Receiver first so nothing published right after SUBACK is missed.
        let mut inbound = client.inbound();
        let filter = self.pipeline.adapters().mqtt.request_filter();
        client.subscribe(&filter).await?;

        let mut shutdown_rx = self.state.subscribe_shutdown();
        self.state.started(None);
        self.state.connection_accepted();
        tracing::info!(
            "MQTT binding subscribed to {} on {}",
            filter,
            client.options().authority()
        );

        let secure = self.section.level >= SecurityLevel::L1;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        loop {
            tokio::select! {
                received = inbound.recv() => {
                    match received {
                        Ok(publish) => {
                            if !iotdm_protocol::mqtt::topic_matches(&filter, &publish.topic) {
                                continue;
                            }
                            tokio::spawn(Self::handle_publish(
                                Arc::clone(client),
                                Arc::clone(&self.pipeline),
                                Arc::clone(&self.state.stats),
                                publish,
                                secure,
                            ));
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("MQTT binding lagged, {} requests dropped", n);
                            self.state.stats.errors_total.fetch_add(n, Ordering::Relaxed);
                        }
                        Err(RecvError::Closed) => {
                            return Err(ClientError::ConnectionClosed.into());
                        }
                    }
                }
                _ = liveness.tick() => {
                    if !client.is_connected() {
                        return Err(ClientError::ConnectionClosed.into());
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("MQTT binding shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl TransportServer for MqttServer {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    async fn run(&self) -> Result<(), ServerError> {
        // Several bindings may share one broker.
        let _registration = RegistrationGuard::acquire(
            &self.registry,
            Registration::shared(Protocol::Mqtt, self.section.port, self.section.level)
                .with_owner("mqtt binding"),
        )?;

        let client = Arc::new(MqttClient::new(self.options(), self.client_config.clone())?);
        client.connect().await?;
        client.spawn_background().await;

        let result = self.serve(&client).await;
        if let Err(e) = client.close().await {
            tracing::debug!("MQTT close failed: {}", e);
        }
        self.state.stopped();
        result
    }

    fn shutdown(&self) {
        self.state.shutdown();
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }
}
