//! MQTT transport client.

use crate::config::{ProtocolClientConfig, SecurityMode};
use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::create_tls_connector;
use iotdm_protocol::mqtt::{Connect, Decoder, Packet, Publish, QoS};
use iotdm_protocol::JsonResponse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Read buffer size for the broker connection (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Capacity of the inbound publish channel.
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Topic prefix of oneM2M response messages.
pub const RESPONSE_TOPIC_PREFIX: &str = "/oneM2M/resp/";

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOptions {
    /// Broker host name or address.
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Keep-alive interval in seconds; 0 disables pings.
    pub keep_alive: u16,
    /// Connect over TLS.
    pub secure: bool,
}

impl MqttOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: 60,
            secure: false,
        }
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// A connection to an MQTT broker.
///
/// Responses to requests sent with [`MqttClient::request`] are correlated by
/// their `rqi`; every other inbound publish is forwarded to subscribers of
/// [`MqttClient::inbound`].
pub struct MqttClient {
    options: MqttOptions,
    config: ProtocolClientConfig,
    writer: Mutex<Option<WriteHalf<ClientStream>>>,
    reader: Mutex<Option<ReadHalf<ClientStream>>>,
    decoder: Mutex<Decoder>,
    /// Requests waiting for a response, by request id.
    pending: Mutex<HashMap<String, oneshot::Sender<JsonResponse>>>,
    /// SUBSCRIBE packets waiting for SUBACK, by packet id.
    acks: Mutex<HashMap<u16, oneshot::Sender<Vec<u8>>>>,
    subscriptions: Mutex<HashSet<String>>,
    next_packet_id: AtomicU16,
    connected: AtomicBool,
    inbound: broadcast::Sender<Publish>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Creates a client (not yet connected).
    pub fn new(options: MqttOptions, config: ProtocolClientConfig) -> Result<Self, ClientError> {
        if config.security == SecurityMode::PreSharedKey {
            return Err(ClientError::UnsupportedSecurity("TLS-PSK".into()));
        }
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Ok(Self {
            options,
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            decoder: Mutex::new(Decoder::new()),
            pending: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            next_packet_id: AtomicU16::new(1),
            connected: AtomicBool::new(false),
            inbound,
            background: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }

    /// Receiver for publishes that are not correlated responses.
    pub fn inbound(&self) -> broadcast::Receiver<Publish> {
        self.inbound.subscribe()
    }

    /// Connects to the broker and completes the CONNECT/CONNACK exchange.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let authority = self.options.authority();
        tracing::debug!("Connecting to MQTT broker {}...", authority);

        let tls = if self.options.secure || self.config.is_secure() {
            let mut config = self.config.clone();
            config.security = SecurityMode::Certificate;
            Some(create_tls_connector(&config)?)
        } else {
            None
        };
        let stream = ClientStream::connect(&authority, &self.options.host, tls.as_ref()).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.decoder.lock().await.clear();

        let connect = Connect::new(self.options.client_id.clone(), self.options.keep_alive);
        self.write_packet(&Packet::Connect(connect)).await?;

        match self.read_packet_direct().await? {
            Packet::ConnAck { return_code: 0, .. } => {}
            Packet::ConnAck { return_code, .. } => return Err(ClientError::BrokerRefused(return_code)),
            other => {
                tracing::debug!("Expected CONNACK, got {:?}", other);
                return Err(ClientError::ConnectionClosed);
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            "Connected to MQTT broker {} as {}",
            authority,
            self.options.client_id
        );
        Ok(())
    }

    /// Starts the read loop and keep-alive pings in a background task.
    pub async fn spawn_background(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                r = client.read_loop() => r,
                r = client.ping_loop() => r,
            };
            client.connected.store(false, Ordering::SeqCst);
            client.pending.lock().await.clear();
            if let Err(e) = result {
                tracing::warn!("MQTT connection to {} ended: {}", client.options.authority(), e);
            }
        });
        *self.background.lock().await = Some(handle);
    }

    /// Reads one packet before the read loop is running.
    async fn read_packet_direct(&self) -> Result<Packet, ClientError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(packet) = self.decoder.lock().await.decode_packet()? {
                return Ok(packet);
            }
            let n = {
                let mut reader_guard = self.reader.lock().await;
                let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                reader.read(&mut buf).await?
            };
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.lock().await.extend(&buf[..n]);
        }
    }

    async fn write_packet(&self, packet: &Packet) -> Result<(), ClientError> {
        let encoded = packet.encode()?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    fn packet_id(&self) -> u16 {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Publishes a message with QoS 0.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        tracing::debug!("MQTT publish to {} ({} bytes)", topic, payload.len());
        self.write_packet(&Packet::Publish(Publish::new(topic, payload)))
            .await
    }

    /// Subscribes to a topic filter; repeated calls for the same filter are no-ops.
    pub async fn subscribe(&self, filter: &str) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if self.subscriptions.lock().await.contains(filter) {
            return Ok(());
        }

        let packet_id = self.packet_id();
        let (tx, rx) = oneshot::channel();
        self.acks.lock().await.insert(packet_id, tx);
        self.write_packet(&Packet::Subscribe {
            packet_id,
            filters: vec![(filter.to_string(), QoS::AtLeastOnce)],
        })
        .await?;

        let return_codes = rx.await.map_err(|_| ClientError::ConnectionClosed)?;
        if let Some(&code) = return_codes.iter().find(|&&c| c == 0x80) {
            return Err(ClientError::BrokerRefused(code));
        }
        self.subscriptions.lock().await.insert(filter.to_string());
        tracing::debug!("Subscribed to {}", filter);
        Ok(())
    }

    /// Publishes a request and waits for the response with the same `rqi`
    /// on a topic matching `response_filter`.
    pub async fn request(
        &self,
        topic: &str,
        request_id: &str,
        payload: Vec<u8>,
        response_filter: &str,
        timeout: Option<Duration>,
    ) -> Result<JsonResponse, ClientError> {
        self.subscribe(response_filter).await?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.to_string(), tx);
        if let Err(e) = self.publish(topic, payload).await {
            self.pending.lock().await.remove(request_id);
            return Err(e);
        }

        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.pending.lock().await.remove(request_id);
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };
        result.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Reads and dispatches inbound packets until the connection drops.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            loop {
                let packet = self.decoder.lock().await.decode_packet()?;
                match packet {
                    Some(packet) => self.dispatch(packet).await?,
                    None => break,
                }
            }

            let n = {
                let mut reader_guard = self.reader.lock().await;
                let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                reader.read(&mut buf).await?
            };
            if n == 0 {
                tracing::debug!("MQTT broker closed the connection");
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.lock().await.extend(&buf[..n]);
        }
    }

    async fn dispatch(&self, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => {
                if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
                    self.write_packet(&Packet::PubAck { packet_id }).await?;
                }
                if publish.topic.starts_with(RESPONSE_TOPIC_PREFIX) {
                    if let Ok(response) = serde_json::from_slice::<JsonResponse>(&publish.payload) {
                        if let Some(tx) = self.pending.lock().await.remove(&response.rqi) {
                            let _ = tx.send(response);
                            return Ok(());
                        }
                    }
                }
                let _ = self.inbound.send(publish);
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                if let Some(tx) = self.acks.lock().await.remove(&packet_id) {
                    let _ = tx.send(return_codes);
                }
            }
            Packet::PingResp | Packet::PubAck { .. } => {}
            other => tracing::debug!("Ignoring unexpected MQTT packet {:?}", other),
        }
        Ok(())
    }

    async fn ping_loop(&self) -> Result<(), ClientError> {
        if self.options.keep_alive == 0 {
            return std::future::pending().await;
        }
        let period = Duration::from_secs(u64::from(self.options.keep_alive) / 2 + 1);
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            tracing::trace!("MQTT ping");
            self.write_packet(&Packet::PingReq).await?;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Disconnects from the broker.
    pub async fn close(&self) -> Result<(), ClientError> {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.background.lock().await.take() {
            handle.abort();
        }
        if was_connected {
            let _ = self.write_packet(&Packet::Disconnect).await;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();
        self.pending.lock().await.clear();
        self.acks.lock().await.clear();
        self.subscriptions.lock().await.clear();
        tracing::debug!("MQTT connection to {} closed", self.options.authority());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use iotdm_protocol::mqtt::topic_matches;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    /// Minimal broker for a single client: acknowledges CONNECT and
    /// SUBSCRIBE, reports publishes, and answers requests on response topics.
    pub(crate) struct FakeBroker {
        pub port: u16,
        pub published: mpsc::UnboundedReceiver<Publish>,
    }

    impl FakeBroker {
        pub(crate) async fn start(answer: Option<u16>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (tx, published) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                serve(socket, tx, answer).await;
            });
            Self { port, published }
        }
    }

    async fn serve(mut socket: TcpStream, tx: mpsc::UnboundedSender<Publish>, answer: Option<u16>) {
        let mut decoder = Decoder::new();
        let mut filters: Vec<String> = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            while let Ok(Some(packet)) = decoder.decode_packet() {
                let reply = match packet {
                    Packet::Connect(_) => Some(Packet::ConnAck {
                        session_present: false,
                        return_code: 0,
                    }),
                    Packet::Subscribe { packet_id, filters: f } => {
                        filters.extend(f.into_iter().map(|(t, _)| t));
                        Some(Packet::SubAck {
                            packet_id,
                            return_codes: vec![1],
                        })
                    }
                    Packet::PingReq => Some(Packet::PingResp),
                    Packet::Publish(publish) => {
                        let response = answer.and_then(|rsc| {
                            let request: serde_json::Value =
                                serde_json::from_slice(&publish.payload).ok()?;
                            let topic = format!("/oneM2M/resp/{}/remote/json", request["fr"].as_str()?);
                            if !filters.iter().any(|f| topic_matches(f, &topic)) {
                                return None;
                            }
                            let body = serde_json::json!({"rsc": rsc, "rqi": request["rqi"]});
                            Some(Packet::Publish(Publish::new(topic, body.to_string())))
                        });
                        let _ = tx.send(publish);
                        response
                    }
                    Packet::Disconnect => return,
                    _ => None,
                };
                if let Some(reply) = reply {
                    socket.write_all(&reply.encode().unwrap()).await.unwrap();
                }
            }
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            decoder.extend(&buf[..n]);
        }
    }

    async fn connected_client(port: u16) -> Arc<MqttClient> {
        let options = MqttOptions::new("127.0.0.1", port, "iotdm-test").with_keep_alive(0);
        let client = Arc::new(MqttClient::new(options, ProtocolClientConfig::default()).unwrap());
        client.connect().await.unwrap();
        client.spawn_background().await;
        client
    }

    #[tokio::test]
    async fn test_publish_reaches_broker() {
        let mut broker = FakeBroker::start(None).await;
        let client = connected_client(broker.port).await;

        client
            .publish("/notify/topic", b"{\"op\":5}".to_vec())
            .await
            .unwrap();
        let publish = broker.published.recv().await.unwrap();
        assert_eq!(publish.topic, "/notify/topic");
        assert_eq!(publish.payload.as_ref(), b"{\"op\":5}");

        client.close().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_request_correlates_by_request_id() {
        let broker = FakeBroker::start(Some(2000)).await;
        let client = connected_client(broker.port).await;

        let payload = serde_json::json!({"op": 2, "to": "/remote/cb", "fr": "in-cse", "rqi": "rqi-42"});
        let response = client
            .request(
                "/oneM2M/req/in-cse/remote/json",
                "rqi-42",
                payload.to_string().into_bytes(),
                "/oneM2M/resp/in-cse/+/json",
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(response.rsc, 2000);
        assert_eq!(response.rqi, "rqi-42");
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let options = MqttOptions::new("127.0.0.1", 1, "idle");
        let client = MqttClient::new(options, ProtocolClientConfig::default()).unwrap();
        assert!(matches!(
            client.publish("/t", Vec::new()).await,
            Err(ClientError::NotConnected)
        ));
        // closing an unconnected client is a no-op
        client.close().await.unwrap();
    }

    #[test]
    fn test_psk_unsupported() {
        let options = MqttOptions::new("broker", 1883, "c");
        let config = ProtocolClientConfig::pre_shared_key(Default::default());
        assert!(matches!(
            MqttClient::new(options, config),
            Err(ClientError::UnsupportedSecurity(_))
        ));
    }
}
