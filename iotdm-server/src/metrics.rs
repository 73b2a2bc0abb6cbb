//! Prometheus metrics for the gateway.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::error::ServerError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use iotdm_client::ClientPool;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Prometheus metrics for the gateway.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Inbound requests by protocol and operation.
    pub requests_total: CounterVec,
    /// Responses by protocol and status code.
    pub responses_total: CounterVec,
    /// Rx pipeline duration by protocol.
    pub request_duration: HistogramVec,
    /// Notifications by protocol and result.
    pub notifications_total: CounterVec,
    /// Requests forwarded to remote CSEs by result.
    pub routed_requests_total: CounterVec,
    /// Pooled Tx clients.
    pub tx_clients_active: Gauge,
    /// Connections or sessions accepted by protocol.
    pub connections_total: CounterVec,
    /// Running transport servers by protocol.
    pub transports_active: GaugeVec,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("iotdm_requests_total", "Inbound requests by protocol and operation"),
            &["protocol", "operation"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let responses_total = CounterVec::new(
            Opts::new("iotdm_responses_total", "Responses by protocol and status code"),
            &["protocol", "status"],
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "iotdm_request_duration_seconds",
                "Request handling duration in seconds by protocol",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["protocol"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let notifications_total = CounterVec::new(
            Opts::new("iotdm_notifications_total", "Notifications sent by protocol and result"),
            &["protocol", "result"],
        )?;
        registry.register(Box::new(notifications_total.clone()))?;

        let routed_requests_total = CounterVec::new(
            Opts::new("iotdm_routed_requests_total", "Requests forwarded to remote CSEs"),
            &["result"],
        )?;
        registry.register(Box::new(routed_requests_total.clone()))?;

        let tx_clients_active = Gauge::with_opts(Opts::new(
            "iotdm_tx_clients_active",
            "Number of pooled outbound clients",
        ))?;
        registry.register(Box::new(tx_clients_active.clone()))?;

        let connections_total = CounterVec::new(
            Opts::new("iotdm_connections_total", "Connections accepted by protocol"),
            &["protocol"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let transports_active = GaugeVec::new(
            Opts::new("iotdm_transports_active", "Running transport servers by protocol"),
            &["protocol"],
        )?;
        registry.register(Box::new(transports_active.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            responses_total,
            request_duration,
            notifications_total,
            routed_requests_total,
            tx_clients_active,
            connections_total,
            transports_active,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, ServerError> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The pool, when given, is sampled for the active client gauge on every scrape.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    pool: Option<Arc<ClientPool>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        let pool = pool.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let pool = pool.clone();
                                async move { handle_request(req, metrics, pool).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn text_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    pool: Option<Arc<ClientPool>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => {
            if let Some(pool) = &pool {
                metrics.tx_clients_active.set(pool.active_clients() as f64);
            }
            match metrics.encode() {
                Ok(body) => text_response(
                    StatusCode::OK,
                    "text/plain; version=0.0.4; charset=utf-8",
                    body,
                ),
                Err(e) => {
                    tracing::error!("Cannot encode metrics: {}", e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encoding failed")
                }
            }
        }
        "/health" | "/healthz" => text_response(StatusCode::OK, "text/plain", "OK"),
        "/" => text_response(
            StatusCode::OK,
            "text/html",
            r#"<!DOCTYPE html>
<html>
<head><title>iotdm Metrics</title></head>
<body>
<h1>iotdm Metrics</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>"#,
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotdm_client::PoolSettings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.requests_total.with_label_values(&["http", "create"]).inc();
        metrics.responses_total.with_label_values(&["http", "2001"]).inc();
        metrics.request_duration.with_label_values(&["coap"]).observe(0.002);
        metrics.notifications_total.with_label_values(&["coap", "sent"]).inc();
        metrics.routed_requests_total.with_label_values(&["ok"]).inc();
        metrics.connections_total.with_label_values(&["http"]).inc();
        metrics.transports_active.with_label_values(&["mqtt"]).set(1.0);
        metrics.tx_clients_active.set(3.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("iotdm_requests_total"));
        assert!(encoded.contains("iotdm_responses_total"));
        assert!(encoded.contains("iotdm_request_duration_seconds"));
        assert!(encoded.contains("iotdm_notifications_total"));
        assert!(encoded.contains("iotdm_tx_clients_active 3"));
        assert!(encoded.contains(r#"iotdm_transports_active{protocol="mqtt"} 1"#));
    }

    #[test]
    fn test_separate_registries() {
        // each instance owns its registry, so two can coexist
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.routed_requests_total.with_label_values(&["failed"]).inc();
        let encoded = String::from_utf8(b.encode().unwrap()).unwrap();
        assert!(!encoded.contains(r#"result="failed""#));
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_server() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = Arc::new(ClientPool::new(PoolSettings::default()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(run_metrics_server(addr, metrics, Some(pool), shutdown_rx));

        let mut scrape = String::new();
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_ok() {
                scrape = get(addr, "/metrics").await;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(scrape.starts_with("HTTP/1.1 200"));
        assert!(scrape.contains("iotdm_tx_clients_active 0"));

        assert!(get(addr, "/healthz").await.ends_with("OK"));
        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
