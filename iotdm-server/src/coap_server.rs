//! CoAP binding server over plain UDP.

use crate::adapter::{CoapInbound, Inbound, Outbound};
use crate::config::ServerSection;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::{Registration, TransportRegistry};
use crate::rx::RxPipeline;
use crate::server::{RegistrationGuard, ServerState, ServerStats, TransportServer};
use async_trait::async_trait;
use iotdm_protocol::coap::{CoapCode, CoapMessage, MessageType};
use iotdm_protocol::{Protocol, SecurityLevel};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Largest datagram read from the socket.
const MAX_DATAGRAM_SIZE: usize = 8192;

/// CoAP server for oneM2M requests.
pub struct CoapServer {
    section: ServerSection,
    pipeline: Arc<RxPipeline>,
    registry: Arc<TransportRegistry>,
    state: ServerState,
}

impl CoapServer {
    pub fn new(
        section: ServerSection,
        pipeline: Arc<RxPipeline>,
        registry: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            section,
            pipeline,
            registry,
            state: ServerState::new(Protocol::Coap),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.state.stats
    }

    async fn handle_datagram(
        socket: Arc<UdpSocket>,
        pipeline: Arc<RxPipeline>,
        stats: Arc<ServerStats>,
        datagram: Vec<u8>,
        peer: SocketAddr,
    ) {
        let message = match CoapMessage::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("[{}] dropping malformed CoAP datagram: {}", peer, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let reply = if message.code == CoapCode::EMPTY {
            // CoAP ping
            if message.message_type != MessageType::Confirmable {
                return;
            }
            CoapMessage::new(MessageType::Reset, CoapCode::EMPTY, message.message_id)
        } else if message.code.is_request() {
            stats.requests_total.fetch_add(1, Ordering::Relaxed);
            let inbound = Inbound::Coap(CoapInbound::new(message, peer));
            match pipeline.process(&inbound).await {
                Outbound::Coap(reply) => reply,
                other => {
                    tracing::error!("CoAP request answered with a non-CoAP message: {:?}", other);
                    return;
                }
            }
        } else {
            tracing::trace!("[{}] ignoring CoAP {} message", peer, message.code);
            return;
        };

        match reply.encode() {
            Ok(encoded) => {
                if let Err(e) = socket.send_to(&encoded, peer).await {
                    tracing::warn!("[{}] cannot send CoAP reply: {}", peer, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::warn!("[{}] cannot encode CoAP reply: {}", peer, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[async_trait]
impl TransportServer for CoapServer {
    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    async fn run(&self) -> Result<(), ServerError> {
        if self.section.level >= SecurityLevel::L1 {
            return Err(ServerError::TransportDisabled {
                protocol: Protocol::Coap,
                reason: "DTLS is not supported".into(),
            });
        }
        let bind_addr = self
            .section
            .bind_addr()
            .map_err(|e| ServerError::TransportDisabled {
                protocol: Protocol::Coap,
                reason: e.to_string(),
            })?;

        let _registration = RegistrationGuard::acquire(
            &self.registry,
            Registration::exclusive(Protocol::Coap, self.section.port, self.section.level)
                .with_owner("coap server"),
        )?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let mut shutdown_rx = self.state.subscribe_shutdown();
        self.state.started(Some(local_addr));
        tracing::info!("CoAP server listening on {}", local_addr);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, peer)) => {
                            tokio::spawn(Self::handle_datagram(
                                Arc::clone(&socket),
                                Arc::clone(&self.pipeline),
                                Arc::clone(&self.state.stats),
                                buf[..n].to_vec(),
                                peer,
                            ));
                        }
                        Err(e) => {
                            // ICMP port unreachable from an earlier send surfaces here
                            tracing::debug!("CoAP receive error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("CoAP server shutting down");
                    break;
                }
            }
        }

        self.state.stopped();
        Ok(())
    }

    fn shutdown(&self) {
        self.state.shutdown();
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CseConfig;
    use iotdm_core::MemoryStore;
    use iotdm_protocol::coap::option;
    use std::time::Duration;

    fn local_server(registry: Arc<TransportRegistry>) -> Arc<CoapServer> {
        let pipeline = RxPipeline::new(Arc::new(MemoryStore::new()), CseConfig::default());
        pipeline.provision_cse_base().unwrap();
        let mut section = ServerSection::new(0);
        section.host = "127.0.0.1".into();
        Arc::new(CoapServer::new(section, Arc::new(pipeline), registry))
    }

    async fn start(server: &Arc<CoapServer>) -> (SocketAddr, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let running = Arc::clone(server);
        let handle = tokio::spawn(async move { running.run().await });
        for _ in 0..200 {
            if let Some(addr) = server.local_addr() {
                return (addr, handle);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not start");
    }

    async fn exchange(addr: SocketAddr, request: &CoapMessage) -> CoapMessage {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&request.encode().unwrap(), addr).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        CoapMessage::decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_dtls_is_disabled() {
        let pipeline = RxPipeline::new(Arc::new(MemoryStore::new()), CseConfig::default());
        let mut section = ServerSection::new(0);
        section.level = SecurityLevel::L1;
        let server = CoapServer::new(section, Arc::new(pipeline), Arc::new(TransportRegistry::new()));
        let err = server.run().await.unwrap_err();
        assert!(err.to_string().contains("DTLS"));
    }

    #[tokio::test]
    async fn test_retrieve_over_udp() {
        let registry = Arc::new(TransportRegistry::new());
        let server = local_server(Arc::clone(&registry));
        let (addr, handle) = start(&server).await;
        assert!(registry.is_registered(Protocol::Coap, 0));

        let mut request = CoapMessage::new(MessageType::Confirmable, CoapCode::GET, 0x1234)
            .with_token(vec![0xAB, 0xCD]);
        request.add_string_option(option::URI_PATH, "InCSE1");
        request.add_string_option(option::ONEM2M_FR, "CAE1");
        request.add_string_option(option::ONEM2M_RQI, "c-1");

        let reply = exchange(addr, &request).await;
        assert_eq!(reply.message_type, MessageType::Acknowledgement);
        assert_eq!(reply.message_id, 0x1234);
        assert_eq!(&reply.token[..], &[0xAB, 0xCD]);
        assert_eq!(reply.code, CoapCode::CONTENT);
        assert_eq!(reply.string_option(option::ONEM2M_RQI).unwrap().as_deref(), Some("c-1"));
        assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 1);

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!registry.is_registered(Protocol::Coap, 0));
    }

    #[tokio::test]
    async fn test_ping_gets_reset() {
        let server = local_server(Arc::new(TransportRegistry::new()));
        let (addr, handle) = start(&server).await;

        let ping = CoapMessage::new(MessageType::Confirmable, CoapCode::EMPTY, 7);
        let reply = exchange(addr, &ping).await;
        assert_eq!(reply.message_type, MessageType::Reset);
        assert_eq!(reply.message_id, 7);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
