//! HTTP binding server.
//!
//! Accepts plain or TLS connections, serves HTTP/1.1 with hyper and hands
//! every request to the [`RxPipeline`].

use crate::adapter::{HttpInbound, Inbound, Outbound};
use crate::config::ServerSection;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::{Registration, TransportRegistry};
use crate::rx::RxPipeline;
use crate::server::{RegistrationGuard, ServerState, ServerStats, TransportServer};
use crate::stream::InboundStream;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use iotdm_protocol::{Protocol, SecurityLevel};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

/// HTTP server for oneM2M requests.
pub struct HttpServer {
    section: ServerSection,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    pipeline: Arc<RxPipeline>,
    registry: Arc<TransportRegistry>,
    state: ServerState,
}

impl HttpServer {
    pub fn new(
        section: ServerSection,
        pipeline: Arc<RxPipeline>,
        registry: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            section,
            tls_acceptor: None,
            pipeline,
            registry,
            state: ServerState::new(Protocol::Http),
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Bound address once the server is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.local_addr()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.state.stats
    }

    async fn serve_connection(
        tcp_stream: TcpStream,
        addr: SocketAddr,
        acceptor: Option<Arc<TlsAcceptor>>,
        pipeline: Arc<RxPipeline>,
        stats: Arc<ServerStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let stream = match acceptor {
            Some(acceptor) => match acceptor.accept(tcp_stream).await {
                Ok(tls) => InboundStream::Tls { stream: tls },
                Err(e) => {
                    tracing::warn!("[{}] TLS handshake failed: {}", addr, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
            None => InboundStream::Plain { stream: tcp_stream },
        };
        let secure = stream.is_tls();
        if secure && stream.has_client_certificate() {
            tracing::debug!("[{}] client certificate verified", addr);
        }

        let service_stats = Arc::clone(&stats);
        let service = service_fn(move |request: Request<Incoming>| {
            let pipeline = Arc::clone(&pipeline);
            let stats = Arc::clone(&service_stats);
            async move {
                Ok::<_, Infallible>(handle_request(request, &pipeline, secure, &stats).await)
            }
        });

        let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!("[{}] connection error: {}", addr, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
            _ = shutdown.recv() => {
                connection.as_mut().graceful_shutdown();
                if let Err(e) = connection.as_mut().await {
                    tracing::debug!("[{}] connection error during shutdown: {}", addr, e);
                }
            }
        }
    }
}

async fn handle_request(
    request: Request<Incoming>,
    pipeline: &RxPipeline,
    secure: bool,
    stats: &ServerStats,
) -> Response<Full<Bytes>> {
    stats.requests_total.fetch_add(1, Ordering::Relaxed);

    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("cannot read request body: {}", e);
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
            return plain_response(StatusCode::BAD_REQUEST, "cannot read request body");
        }
    };

    let inbound = Inbound::Http(HttpInbound::new(Request::from_parts(parts, body), secure));
    let response = match pipeline.process(&inbound).await {
        Outbound::Http(response) => response,
        other => {
            tracing::error!("HTTP request answered with a non-HTTP message: {:?}", other);
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    };
    if response.status().is_server_error() {
        stats.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    response
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}

#[async_trait]
impl TransportServer for HttpServer {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn run(&self) -> Result<(), ServerError> {
        if self.section.level >= SecurityLevel::L1 && self.tls_acceptor.is_none() {
            return Err(ServerError::TransportDisabled {
                protocol: Protocol::Http,
                reason: "security level L1 requires a TLS key store".into(),
            });
        }
        let bind_addr = self
            .section
            .bind_addr()
            .map_err(|e| ServerError::TransportDisabled {
                protocol: Protocol::Http,
                reason: e.to_string(),
            })?;

        let _registration = RegistrationGuard::acquire(
            &self.registry,
            Registration::exclusive(Protocol::Http, self.section.port, self.section.level)
                .with_owner("http server"),
        )?;

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let mut shutdown_rx = self.state.subscribe_shutdown();
        self.state.started(Some(local_addr));

        let tls_mode = if self.tls_enabled() { "TLS" } else { "plain" };
        tracing::info!("HTTP server listening on {} ({})", local_addr, tls_mode);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            self.state.connection_accepted();
                            tracing::debug!("HTTP connection from {}", addr);
                            tokio::spawn(Self::serve_connection(
                                tcp_stream,
                                addr,
                                self.tls_acceptor.clone(),
                                Arc::clone(&self.pipeline),
                                Arc::clone(&self.state.stats),
                                self.state.subscribe_shutdown(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("HTTP server shutting down");
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
