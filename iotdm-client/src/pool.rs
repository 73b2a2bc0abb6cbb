//! Transport client pool.

use crate::coap::CoapClient;
use crate::config::ProtocolClientConfig;
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::http::HttpClient;
use crate::mqtt::{MqttClient, MqttOptions};
use dashmap::DashMap;
use iotdm_protocol::{Protocol, DEFAULT_MQTT_PORT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Pool-wide client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Broker used by `mqtt:/topic` URLs (`host:port`).
    pub default_mqtt_broker: Option<String>,
    /// Prefix of MQTT client ids.
    pub client_id_prefix: String,
    /// Response timeout for routed requests; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            default_mqtt_broker: None,
            client_id_prefix: "iotdm".to_string(),
            request_timeout: None,
        }
    }
}

/// Identity of a pooled client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub protocol: Protocol,
    pub config: ProtocolClientConfig,
    /// Broker `host:port` for MQTT clients.
    pub broker: Option<String>,
}

impl ClientKey {
    pub fn new(protocol: Protocol, config: ProtocolClientConfig) -> Self {
        Self {
            protocol,
            config,
            broker: None,
        }
    }

    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }
}

/// A started transport client.
pub enum TransportClient {
    Http(HttpClient),
    Coap(CoapClient),
    Mqtt(Arc<MqttClient>),
}

impl TransportClient {
    pub fn protocol(&self) -> Protocol {
        match self {
            TransportClient::Http(_) => Protocol::Http,
            TransportClient::Coap(_) => Protocol::Coap,
            TransportClient::Mqtt(_) => Protocol::Mqtt,
        }
    }
}

enum Slot {
    Ready(Arc<TransportClient>),
    /// Startup failed; the configuration stays disabled.
    Disabled(String),
}

/// One long-lived client per (transport, security configuration).
///
/// Clients are created lazily on first use. Creation is serialized per key
/// while use is unrestricted. A client that fails to start disables its key
/// without affecting any other.
pub struct ClientPool {
    clients: DashMap<ClientKey, Arc<OnceCell<Slot>>>,
    settings: PoolSettings,
    shut_down: AtomicBool,
}

impl ClientPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            clients: DashMap::new(),
            settings,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Builds the key serving an endpoint under a given configuration.
    pub fn key_for(
        &self,
        endpoint: &Endpoint,
        config: &ProtocolClientConfig,
    ) -> Result<ClientKey, ClientError> {
        let key = ClientKey::new(endpoint.protocol, config.clone());
        if endpoint.protocol != Protocol::Mqtt {
            return Ok(key);
        }
        match endpoint.authority() {
            Some(authority) => Ok(key.with_broker(authority)),
            None => self
                .settings
                .default_mqtt_broker
                .as_ref()
                .map(|broker| key.clone().with_broker(broker.clone()))
                .ok_or_else(|| {
                    ClientError::InvalidTarget(format!(
                        "{}: no default MQTT broker configured",
                        endpoint
                    ))
                }),
        }
    }

    /// Returns the client for a key, starting it on first use.
    pub async fn get(&self, key: &ClientKey) -> Result<Arc<TransportClient>, ClientError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::ShutDown);
        }
        let cell = Arc::clone(
            self.clients
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        let slot = cell
            .get_or_init(|| async {
                match self.start(key).await {
                    Ok(client) => {
                        tracing::info!(
                            "Started {} client ({})",
                            key.protocol,
                            key.config.mode_label()
                        );
                        Slot::Ready(Arc::new(client))
                    }
                    Err(e) => {
                        tracing::error!(
                            "{} client ({}) failed to start, configuration disabled: {}",
                            key.protocol,
                            key.config.mode_label(),
                            e
                        );
                        Slot::Disabled(e.to_string())
                    }
                }
            })
            .await;

        match slot {
            Slot::Ready(client) if self.shut_down.load(Ordering::SeqCst) => {
                // Started after shutdown collected the pool.
                self.clients.remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
                release(client).await;
                Err(ClientError::ShutDown)
            }
            Slot::Ready(client) => Ok(Arc::clone(client)),
            Slot::Disabled(reason) => Err(ClientError::Disabled {
                protocol: key.protocol,
                reason: reason.clone(),
            }),
        }
    }

    async fn start(&self, key: &ClientKey) -> Result<TransportClient, ClientError> {
        match key.protocol {
            Protocol::Http => Ok(TransportClient::Http(HttpClient::new(key.config.clone())?)),
            Protocol::Coap => Ok(TransportClient::Coap(
                CoapClient::new(key.config.clone())?
                    .with_response_timeout(self.settings.request_timeout),
            )),
            Protocol::Mqtt => {
                let broker = key
                    .broker
                    .as_deref()
                    .ok_or_else(|| ClientError::InvalidTarget("missing MQTT broker".into()))?;
                let (host, port) = split_broker(broker)?;
                let client_id = format!(
                    "{}-{}",
                    self.settings.client_id_prefix,
                    &uuid::Uuid::new_v4().simple().to_string()[..8]
                );
                let client = Arc::new(MqttClient::new(
                    MqttOptions::new(host, port, client_id),
                    key.config.clone(),
                )?);
                client.connect().await?;
                client.spawn_background().await;
                Ok(TransportClient::Mqtt(client))
            }
        }
    }

    /// Number of clients that started successfully.
    pub fn active_clients(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| matches!(entry.value().get(), Some(Slot::Ready(_))))
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Releases every client. Repeated calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let cells: Vec<_> = self
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.clients.clear();

        let mut released = 0;
        for cell in cells {
            if let Some(Slot::Ready(client)) = cell.get() {
                release(client).await;
                released += 1;
            }
        }
        tracing::info!("Client pool shut down ({} clients released)", released);
    }
}

async fn release(client: &TransportClient) {
    if let TransportClient::Mqtt(mqtt) = client {
        if let Err(e) = mqtt.close().await {
            tracing::warn!("Error closing MQTT client: {}", e);
        }
    }
}

fn split_broker(broker: &str) -> Result<(String, u16), ClientError> {
    let invalid = || ClientError::InvalidTarget(format!("invalid MQTT broker: {}", broker));
    if let Some(rest) = broker.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None => DEFAULT_MQTT_PORT,
        };
        return Ok((host.to_string(), port));
    }
    match broker.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse().map_err(|_| invalid())?)),
        None => Ok((broker.to_string(), DEFAULT_MQTT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityMode;
    use crate::mqtt::tests::FakeBroker;

    #[tokio::test]
    async fn test_equal_configs_share_a_client() {
        let pool = ClientPool::new(PoolSettings::default());
        let a = pool
            .get(&ClientKey::new(Protocol::Http, ProtocolClientConfig::default()))
            .await
            .unwrap();

        let mut other_default = ProtocolClientConfig::default();
        other_default.level = iotdm_protocol::SecurityLevel::L1;
        let b = pool
            .get(&ClientKey::new(Protocol::Http, other_default))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.active_clients(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_disables_only_that_key() {
        let pool = ClientPool::new(PoolSettings::default());
        let mut dtls = ProtocolClientConfig::plain();
        dtls.security = SecurityMode::Certificate;

        let err = pool
            .get(&ClientKey::new(Protocol::Coap, dtls.clone()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Disabled { protocol: Protocol::Coap, .. }));

        // stays disabled
        assert!(pool.get(&ClientKey::new(Protocol::Coap, dtls)).await.is_err());

        // other configurations are unaffected
        assert!(pool
            .get(&ClientKey::new(Protocol::Coap, ProtocolClientConfig::default()))
            .await
            .is_ok());
        assert_eq!(pool.active_clients(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_creates_once() {
        let broker = FakeBroker::start(None).await;
        let pool = Arc::new(ClientPool::new(PoolSettings::default()));
        let key = ClientKey::new(Protocol::Mqtt, ProtocolClientConfig::default())
            .with_broker(format!("127.0.0.1:{}", broker.port));

        // the fake broker accepts exactly one connection
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let key = key.clone();
                tokio::spawn(async move { pool.get(&key).await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            tokio_test::assert_ok!(handle.await.unwrap());
        }
        assert_eq!(pool.active_clients(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = ClientPool::new(PoolSettings::default());
        pool.get(&ClientKey::new(Protocol::Http, ProtocolClientConfig::default()))
            .await
            .unwrap();

        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.is_shut_down());
        assert_eq!(pool.active_clients(), 0);
        assert!(matches!(
            pool.get(&ClientKey::new(Protocol::Http, ProtocolClientConfig::default()))
                .await,
            Err(ClientError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_client_started_during_shutdown_is_closed() {
        use iotdm_protocol::mqtt::Packet;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = Arc::new(ClientPool::new(PoolSettings::default()));
        let key = ClientKey::new(Protocol::Mqtt, ProtocolClientConfig::default())
            .with_broker(format!("127.0.0.1:{}", port));

        let getter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&key).await.map(|_| ()) })
        };

        // Hold the CONNACK until the pool has shut down.
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        assert!(socket.read(&mut buf).await.unwrap() > 0);
        pool.shutdown().await;
        let connack = Packet::ConnAck {
            session_present: false,
            return_code: 0,
        };
        socket.write_all(&connack.encode().unwrap()).await.unwrap();

        assert!(matches!(getter.await.unwrap(), Err(ClientError::ShutDown)));
        assert_eq!(pool.active_clients(), 0);

        // The late client disconnects instead of lingering.
        let closed = tokio::time::timeout(std::time::Duration::from_secs(3), async {
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[test]
    fn test_mqtt_keys() {
        let pool = ClientPool::new(PoolSettings {
            default_mqtt_broker: Some("broker.local:1883".into()),
            ..Default::default()
        });
        let config = ProtocolClientConfig::default();

        let key = pool
            .key_for(&Endpoint::parse("mqtt:/topic").unwrap(), &config)
            .unwrap();
        assert_eq!(key.broker.as_deref(), Some("broker.local:1883"));

        let key = pool
            .key_for(&Endpoint::parse("mqtt://other:2883/topic").unwrap(), &config)
            .unwrap();
        assert_eq!(key.broker.as_deref(), Some("other:2883"));

        let bare = ClientPool::new(PoolSettings::default());
        assert!(bare
            .key_for(&Endpoint::parse("mqtt:/topic").unwrap(), &config)
            .is_err());
    }

    #[test]
    fn test_split_broker() {
        assert_eq!(split_broker("h:1").unwrap(), ("h".to_string(), 1));
        assert_eq!(split_broker("h").unwrap(), ("h".to_string(), 1883));
        assert_eq!(split_broker("[::1]:2").unwrap(), ("::1".to_string(), 2));
        assert!(split_broker("h:x").is_err());
    }
}
