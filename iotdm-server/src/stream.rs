//! Accepted HTTP connection, plain or TLS.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

pin_project! {
    /// Inbound connection of the HTTP server.
    #[project = InboundStreamProj]
    pub enum InboundStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ServerTlsStream<TcpStream> },
    }
}

impl InboundStream {
    /// Whether requests on this connection negotiated TLS (security level L1).
    pub fn is_tls(&self) -> bool {
        matches!(self, InboundStream::Tls { .. })
    }

    /// Whether the peer presented a verified client certificate.
    pub fn has_client_certificate(&self) -> bool {
        match self {
            InboundStream::Plain { .. } => false,
            InboundStream::Tls { stream } => stream
                .get_ref()
                .1
                .peer_certificates()
                .is_some_and(|certs| !certs.is_empty()),
        }
    }
}

impl AsyncRead for InboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            InboundStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            InboundStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for InboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            InboundStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            InboundStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            InboundStreamProj::Plain { stream } => stream.poll_flush(cx),
            InboundStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            InboundStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            InboundStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
