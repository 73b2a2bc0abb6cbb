//! Inter-CSE routing front-end of the Tx pipeline.

use crate::config::ProtocolClientConfig;
use crate::endpoint::Endpoint;
use crate::pool::ClientPool;
use crate::request::{TxContext, TxJob, TxPurpose, TxRequest};
use crate::tx::TxPipeline;
use iotdm_protocol::{GatewayError, Protocol, RequestPrimitive, ResponsePrimitive};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Forwards requests addressed to remote CSEs and returns their responses.
pub struct Router {
    pool: Arc<ClientPool>,
    /// CSE-ID of this gateway.
    cse_id: String,
    configs: HashMap<Protocol, ProtocolClientConfig>,
}

impl Router {
    pub fn new(pool: Arc<ClientPool>, cse_id: impl Into<String>) -> Self {
        Self {
            pool,
            cse_id: cse_id.into(),
            configs: HashMap::new(),
        }
    }

    pub fn with_config(mut self, protocol: Protocol, config: ProtocolClientConfig) -> Self {
        self.configs.insert(protocol, config);
        self
    }

    pub fn cse_id(&self) -> &str {
        &self.cse_id
    }

    /// Sends `primitive` to the CSE at `next_hop` and waits for its response.
    ///
    /// Any pipeline failure is reported as `TransportSendFailure`.
    pub async fn route(
        &self,
        primitive: RequestPrimitive,
        next_hop: &str,
    ) -> Result<ResponsePrimitive, GatewayError> {
        let endpoint = Endpoint::parse(next_hop).map_err(|e| {
            GatewayError::TransportSendFailure(format!("invalid next hop {}: {}", next_hop, e))
        })?;
        let request_id = primitive.request_id().to_string();
        let config = self
            .configs
            .get(&endpoint.protocol)
            .cloned()
            .unwrap_or_default();

        let (reply, response) = oneshot::channel();
        let ctx = TxContext::new(
            endpoint,
            primitive,
            config,
            self.cse_id.clone(),
            TxPurpose::Route { reply: Some(reply) },
        );
        let mut job = TxJob::new(Arc::clone(&self.pool), TxRequest::new(ctx));
        let outcome = TxPipeline::run(&mut job).await;

        if let Some(stage) = outcome.failed_at {
            let ctx = job.into_request().into_ctx();
            let cause = ctx.failure.unwrap_or_else(|| "unknown cause".to_string());
            tracing::warn!(
                "Routing {} to {} failed at {}: {}",
                request_id,
                next_hop,
                stage,
                cause
            );
            return Err(GatewayError::TransportSendFailure(format!(
                "{} failed at {}: {}",
                next_hop, stage, cause
            )));
        }
        drop(job);
        response.await.map_err(|_| {
            GatewayError::TransportSendFailure(format!("{}: response lost", next_hop))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;
    use iotdm_protocol::{Operation, ResponseStatusCode};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn router() -> Router {
        Router::new(Arc::new(ClientPool::new(PoolSettings::default())), "in-cse")
    }

    #[tokio::test]
    async fn test_route_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 4096];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let body = b"{\"m2m:cb\":{\"csi\":\"/remote\"}}";
            let head = format!(
                "HTTP/1.1 200 OK\r\nX-M2M-RSC: 2000\r\nX-M2M-RI: rqi-route\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            String::from_utf8(received).unwrap()
        });

        let primitive = RequestPrimitive::builder(Operation::Retrieve, "/remote/cb")
            .with_request_id("rqi-route")
            .build()
            .unwrap();
        let response = router()
            .route(primitive, &format!("http://{}/", addr))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatusCode::Ok);
        assert_eq!(response.request_id, "rqi-route");
        assert_eq!(response.content.unwrap()["m2m:cb"]["csi"], "/remote");

        let raw = remote.await.unwrap().to_ascii_lowercase();
        assert!(raw.starts_with("get /~/remote/cb http/1.1"));
        assert!(raw.contains("x-m2m-origin: in-cse"));
    }

    #[tokio::test]
    async fn test_unreachable_next_hop() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let primitive = RequestPrimitive::builder(Operation::Retrieve, "/remote/cb")
            .build()
            .unwrap();
        let err = router()
            .route(primitive, &format!("http://{}/", addr))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), ResponseStatusCode::TargetNotReachable);
        assert!(err.message().contains("send"));
    }

    #[tokio::test]
    async fn test_invalid_next_hop() {
        let primitive = RequestPrimitive::builder(Operation::Retrieve, "/remote/cb")
            .build()
            .unwrap();
        let err = router().route(primitive, "nowhere").await.unwrap_err();
        assert!(matches!(err, GatewayError::TransportSendFailure(_)));
    }
}
