//! CoAP transport client.

use crate::config::ProtocolClientConfig;
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use bytes::Bytes;
use iotdm_protocol::coap::{CoapCode, CoapMessage, MessageType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest datagram accepted in a response.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// UDP CoAP client.
///
/// Notifications go out as fire-and-forget NON messages; routed requests
/// are sent confirmable and wait for the response carrying the same token.
pub struct CoapClient {
    config: ProtocolClientConfig,
    next_message_id: AtomicU16,
    response_timeout: Option<Duration>,
}

impl CoapClient {
    /// Creates a client. Secured configurations need DTLS, which is not
    /// available, so they fail here and disable the configuration.
    pub fn new(config: ProtocolClientConfig) -> Result<Self, ClientError> {
        if config.is_secure() {
            return Err(ClientError::UnsupportedSecurity(format!(
                "DTLS ({})",
                config.mode_label()
            )));
        }
        Ok(Self {
            config,
            next_message_id: AtomicU16::new(rand_seed()),
            response_timeout: None,
        })
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ProtocolClientConfig {
        &self.config
    }

    fn message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a message without waiting for any reply.
    pub async fn send(&self, endpoint: &Endpoint, mut message: CoapMessage) -> Result<(), ClientError> {
        let addr = resolve(endpoint).await?;
        message.message_id = self.message_id();
        let socket = bind_for(&addr).await?;
        let encoded = message.encode()?;
        socket.send_to(&encoded, addr).await?;
        tracing::debug!(
            "CoAP {} sent to {} (mid={}, {} bytes)",
            message.code,
            addr,
            message.message_id,
            encoded.len()
        );
        Ok(())
    }

    /// Sends a request and waits for the matching response.
    pub async fn request(
        &self,
        endpoint: &Endpoint,
        mut message: CoapMessage,
    ) -> Result<CoapMessage, ClientError> {
        let addr = resolve(endpoint).await?;
        message.message_id = self.message_id();
        if message.token.is_empty() {
            message.token = Bytes::copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..4]);
        }
        let socket = bind_for(&addr).await?;
        socket.send_to(&message.encode()?, addr).await?;
        tracing::debug!(
            "CoAP {} request to {} (mid={})",
            message.code,
            addr,
            message.message_id
        );

        let exchange = await_response(&socket, addr, &message);
        match self.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| ClientError::Timeout)?,
            None => exchange.await,
        }
    }
}

async fn await_response(
    socket: &UdpSocket,
    peer: SocketAddr,
    request: &CoapMessage,
) -> Result<CoapMessage, ClientError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if from != peer {
            continue;
        }
        let response = match CoapMessage::decode(&buf[..n]) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Ignoring malformed CoAP datagram from {}: {}", from, e);
                continue;
            }
        };

        match response.message_type {
            MessageType::Reset if response.message_id == request.message_id => {
                return Err(ClientError::ConnectionClosed);
            }
            // empty ACK: the response follows separately
            MessageType::Acknowledgement if response.code == CoapCode::EMPTY => continue,
            _ => {}
        }
        if response.token != request.token || response.code.is_request() {
            continue;
        }
        if response.message_type == MessageType::Confirmable {
            let ack = CoapMessage::new(
                MessageType::Acknowledgement,
                CoapCode::EMPTY,
                response.message_id,
            );
            socket.send_to(&ack.encode()?, peer).await?;
        }
        return Ok(response);
    }
}

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, ClientError> {
    if endpoint.secure {
        return Err(ClientError::UnsupportedSecurity("DTLS (coaps)".into()));
    }
    let authority = endpoint
        .authority()
        .ok_or_else(|| ClientError::InvalidTarget(endpoint.to_string()))?;
    let addr = tokio::net::lookup_host(&authority)
        .await?
        .next()
        .ok_or_else(|| ClientError::InvalidTarget(format!("cannot resolve {}", authority)))?;
    Ok(addr)
}

async fn bind_for(peer: &SocketAddr) -> Result<UdpSocket, ClientError> {
    let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    Ok(UdpSocket::bind(local).await?)
}

fn rand_seed() -> u16 {
    let bytes = uuid::Uuid::new_v4();
    let bytes = bytes.as_bytes();
    u16::from_be_bytes([bytes[0], bytes[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotdm_protocol::coap::option;

    async fn peer() -> (UdpSocket, Endpoint) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let endpoint = Endpoint::parse(&format!("coap://{}/notify", addr)).unwrap();
        (socket, endpoint)
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let endpoint = Endpoint::parse("coap://127.0.0.1:5683/notify").unwrap();
        let addr = resolve(&endpoint).await.unwrap();
        assert_eq!(addr, "127.0.0.1:5683".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_send_is_fire_and_forget() {
        let (server, endpoint) = peer().await;
        let client = CoapClient::new(ProtocolClientConfig::default()).unwrap();

        let mut message = CoapMessage::new(MessageType::NonConfirmable, CoapCode::POST, 0);
        message.set_uri_path("/notify");
        message.add_string_option(option::ONEM2M_RQI, "rqi-9");
        client.send(&endpoint, message).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let received = CoapMessage::decode(&buf[..n]).unwrap();
        assert_eq!(received.code, CoapCode::POST);
        assert_eq!(received.uri_path().unwrap(), "/notify");
        assert_eq!(
            received.string_option(option::ONEM2M_RQI).unwrap().as_deref(),
            Some("rqi-9")
        );
    }

    #[tokio::test]
    async fn test_request_matches_token() {
        let (server, endpoint) = peer().await;
        let client = CoapClient::new(ProtocolClientConfig::default())
            .unwrap()
            .with_response_timeout(Some(Duration::from_secs(5)));

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let request = CoapMessage::decode(&buf[..n]).unwrap();

            // unrelated token first, then the real answer
            let stray = CoapMessage::response_to(&request, CoapCode::NOT_FOUND)
                .with_token(Bytes::from_static(b"zz"));
            server.send_to(&stray.encode().unwrap(), from).await.unwrap();

            let response = CoapMessage::response_to(&request, CoapCode::CONTENT)
                .with_payload(Bytes::from_static(b"{}"));
            server.send_to(&response.encode().unwrap(), from).await.unwrap();
        });

        let request = CoapMessage::new(MessageType::Confirmable, CoapCode::GET, 0);
        let response = client.request(&endpoint, request).await.unwrap();
        assert_eq!(response.code, CoapCode::CONTENT);
        assert_eq!(response.payload.as_ref(), b"{}");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (_server, endpoint) = peer().await;
        let client = CoapClient::new(ProtocolClientConfig::default())
            .unwrap()
            .with_response_timeout(Some(Duration::from_millis(50)));
        let request = CoapMessage::new(MessageType::Confirmable, CoapCode::GET, 0);
        assert!(matches!(
            client.request(&endpoint, request).await,
            Err(ClientError::Timeout)
        ));
    }

    #[test]
    fn test_secure_config_unsupported() {
        let mut config = ProtocolClientConfig::plain();
        config.security = crate::config::SecurityMode::Certificate;
        assert!(matches!(
            CoapClient::new(config),
            Err(ClientError::UnsupportedSecurity(_))
        ));
    }

    #[tokio::test]
    async fn test_coaps_target_unsupported() {
        let client = CoapClient::new(ProtocolClientConfig::default()).unwrap();
        let endpoint = Endpoint::parse("coaps://127.0.0.1/x").unwrap();
        let message = CoapMessage::new(MessageType::NonConfirmable, CoapCode::POST, 0);
        assert!(matches!(
            client.send(&endpoint, message).await,
            Err(ClientError::UnsupportedSecurity(_))
        ));
    }
}
