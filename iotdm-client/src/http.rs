//! HTTP transport client.

use crate::config::{ProtocolClientConfig, SecurityMode};
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::create_tls_connector;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;

/// Blocking request/response HTTP client.
///
/// One connection is opened per exchange; the client itself holds the
/// security material and is shared by every Tx request using its config.
pub struct HttpClient {
    config: ProtocolClientConfig,
    tls: Option<TlsConnector>,
    /// Web-PKI connector for `https` targets of a plain client, built on
    /// first use.
    web_pki: OnceCell<TlsConnector>,
}

impl HttpClient {
    pub fn new(config: ProtocolClientConfig) -> Result<Self, ClientError> {
        let tls = match config.security {
            SecurityMode::None => None,
            SecurityMode::Certificate => Some(create_tls_connector(&config)?),
            SecurityMode::PreSharedKey => {
                return Err(ClientError::UnsupportedSecurity("TLS-PSK".into()))
            }
        };
        Ok(Self {
            config,
            tls,
            web_pki: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &ProtocolClientConfig {
        &self.config
    }

    /// Sends a request and collects the full response body.
    pub async fn send(
        &self,
        endpoint: &Endpoint,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>, ClientError> {
        let host = endpoint
            .host
            .as_deref()
            .ok_or_else(|| ClientError::InvalidTarget(endpoint.to_string()))?;
        let authority = endpoint
            .authority()
            .ok_or_else(|| ClientError::InvalidTarget(endpoint.to_string()))?;

        let tls = match (&self.tls, endpoint.secure) {
            (_, false) => None,
            (Some(connector), true) => Some(connector),
            (None, true) => Some(self.web_pki_connector().await?),
        };

        tracing::debug!(
            "HTTP {} {} ({})",
            request.method(),
            endpoint,
            self.config.mode_label()
        );
        let stream = ClientStream::connect(&authority, host, tls).await?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("HTTP connection error: {}", e);
            }
        });

        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        tracing::debug!("HTTP response {} from {}", parts.status, endpoint);
        Ok(Response::from_parts(parts, body))
    }

    async fn web_pki_connector(&self) -> Result<&TlsConnector, ClientError> {
        self.web_pki
            .get_or_try_init(|| async {
                let mut config = ProtocolClientConfig::default();
                config.security = SecurityMode::Certificate;
                create_tls_connector(&config)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HOST;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_web_pki_connector_built_once() {
        let client = HttpClient::new(ProtocolClientConfig::default()).unwrap();
        assert!(client.web_pki.get().is_none());

        let first = client.web_pki_connector().await.unwrap() as *const TlsConnector;
        let second = client.web_pki_connector().await.unwrap() as *const TlsConnector;
        assert!(std::ptr::eq(first, second));
        assert!(client.web_pki.get().is_some());
    }

    #[tokio::test]
    async fn test_exchange_with_plain_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if n == 0 || received.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nX-M2M-RSC: 2000\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
                )
                .await
                .unwrap();
            String::from_utf8(received).unwrap()
        });

        let client = HttpClient::new(ProtocolClientConfig::default()).unwrap();
        let endpoint = Endpoint::parse(&format!("http://{}/notify", addr)).unwrap();
        let request = Request::get("/notify")
            .header(HOST, endpoint.authority().unwrap())
            .header("X-M2M-RI", "rqi-1")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = client.send(&endpoint, request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-m2m-rsc"], "2000");
        assert_eq!(response.body().as_ref(), b"{}");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("GET /notify HTTP/1.1"));
        assert!(raw.to_ascii_lowercase().contains("x-m2m-ri: rqi-1"));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::new(ProtocolClientConfig::default()).unwrap();
        let endpoint = Endpoint::parse(&format!("http://{}/", addr)).unwrap();
        let request = Request::get("/").body(Full::new(Bytes::new())).unwrap();
        assert!(matches!(
            client.send(&endpoint, request).await,
            Err(ClientError::Io(_))
        ));
    }

    #[test]
    fn test_psk_client_unsupported() {
        let config = ProtocolClientConfig::pre_shared_key(Default::default());
        assert!(matches!(
            HttpClient::new(config),
            Err(ClientError::UnsupportedSecurity(_))
        ));
    }
}
