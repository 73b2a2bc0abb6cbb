//! Outbound byte stream, plain TCP or TLS.

use crate::error::ClientError;
use pin_project_lite::pin_project;
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pin_project! {
    /// Connection used by the HTTP and MQTT clients.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Opens a TCP connection to `authority`, upgrading to TLS when a
    /// connector is supplied.
    pub async fn connect(
        authority: &str,
        host: &str,
        tls: Option<&TlsConnector>,
    ) -> Result<Self, ClientError> {
        let tcp = TcpStream::connect(authority).await?;
        tcp.set_nodelay(true).ok();

        let Some(connector) = tls else {
            return Ok(ClientStream::Plain { stream: tcp });
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", host)))?;
        tracing::trace!("TLS handshake with {}", authority);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
        Ok(ClientStream::Tls { stream })
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
