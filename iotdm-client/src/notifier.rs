//! Notification front-end of the Tx pipeline.

use crate::config::ProtocolClientConfig;
use crate::endpoint::Endpoint;
use crate::pool::ClientPool;
use crate::request::{TxContext, TxJob, TxPurpose, TxRequest};
use crate::tx::{TxOutcome, TxPipeline, TxStage};
use iotdm_protocol::{
    content_type, generate_request_id, Operation, Protocol, RequestPrimitive,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One notification to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationTarget {
    /// Destination URL (`http`, `https`, `coap`, `mqtt`).
    pub url: String,
    pub payload: Value,
    /// CSE-ID of the sending cseBase.
    pub sender: String,
    pub request_id: String,
}

impl NotificationTarget {
    /// Creates a target with a fresh request id.
    pub fn new(url: impl Into<String>, payload: Value, sender: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload,
            sender: sender.into(),
            request_id: generate_request_id(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Protocol of the destination, if the URL names a supported one.
    pub fn protocol(&self) -> Option<Protocol> {
        let (scheme, _) = self.url.split_once(':')?;
        Protocol::from_scheme(scheme)
    }
}

/// Sends notifications using the notifier configuration of each protocol.
pub struct Notifier {
    pool: Arc<ClientPool>,
    configs: HashMap<Protocol, ProtocolClientConfig>,
}

impl Notifier {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self {
            pool,
            configs: HashMap::new(),
        }
    }

    /// Sets the client configuration used for one protocol. Protocols
    /// without one use the default configuration.
    pub fn with_config(mut self, protocol: Protocol, config: ProtocolClientConfig) -> Self {
        self.configs.insert(protocol, config);
        self
    }

    pub fn config_for(&self, protocol: Protocol) -> ProtocolClientConfig {
        self.configs.get(&protocol).cloned().unwrap_or_default()
    }

    /// Delivers one notification. Failures are logged and reported in the
    /// outcome; nothing is retried.
    pub async fn notify(&self, target: NotificationTarget) -> TxOutcome {
        let endpoint = match Endpoint::parse(&target.url) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!("Dropping notification {}: {}", target.request_id, e);
                return TxOutcome::failed_at(TxStage::Preprocess, Vec::new());
            }
        };
        let primitive = RequestPrimitive::builder(Operation::Notify, target.url.clone())
            .with_request_id(target.request_id.clone())
            .with_from(target.sender.clone())
            .with_content(target.payload, content_type::NTFY_JSON)
            .build();
        let primitive = match primitive {
            Ok(primitive) => primitive,
            Err(e) => {
                tracing::warn!("Dropping notification {}: {}", target.request_id, e);
                return TxOutcome::failed_at(TxStage::Preprocess, Vec::new());
            }
        };

        let config = self.config_for(endpoint.protocol);
        let ctx = TxContext::new(endpoint, primitive, config, target.sender, TxPurpose::Notify);
        let mut job = TxJob::new(Arc::clone(&self.pool), TxRequest::new(ctx));
        let outcome = TxPipeline::run(&mut job).await;

        let ctx = job.into_request().into_ctx();
        match (&outcome.failed_at, &ctx.failure) {
            (None, _) => tracing::debug!("Notification {} sent to {}", target.request_id, target.url),
            (Some(stage), cause) => tracing::warn!(
                "Notification {} to {} failed at {}: {}",
                target.request_id,
                target.url,
                stage,
                cause.as_deref().unwrap_or("unknown cause")
            ),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;
    use iotdm_protocol::coap::{option, CoapMessage};
    use serde_json::json;
    use tokio::net::UdpSocket;

    fn notifier() -> Notifier {
        Notifier::new(Arc::new(ClientPool::new(PoolSettings::default())))
    }

    #[test]
    fn test_target_protocol() {
        let target = NotificationTarget::new("coap://h/n", json!({}), "InCSE1");
        assert_eq!(target.protocol(), Some(Protocol::Coap));
        assert!(target.request_id.starts_with("rqi-"));
        assert_eq!(NotificationTarget::new("ftp://h", json!({}), "c").protocol(), None);
    }

    #[tokio::test]
    async fn test_invalid_url_fails_in_preprocess() {
        let outcome = notifier()
            .notify(NotificationTarget::new("not a url", json!({}), "InCSE1"))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_at, Some(TxStage::Preprocess));
    }

    #[tokio::test]
    async fn test_coap_notification_delivered() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("coap://{}/monitor", server.local_addr().unwrap());
        let target = NotificationTarget::new(url, json!({"m2m:sgn": {"net": 3}}), "InCSE1")
            .with_request_id("rqi-77");

        let outcome = notifier().notify(target).await;
        assert!(outcome.success);
        assert_eq!(outcome.completed, TxStage::ORDERED.to_vec());

        let mut buf = vec![0u8; 4096];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let message = CoapMessage::decode(&buf[..n]).unwrap();
        assert_eq!(
            message.string_option(option::ONEM2M_FR).unwrap().as_deref(),
            Some("InCSE1")
        );
        assert_eq!(
            message.string_option(option::ONEM2M_RQI).unwrap().as_deref(),
            Some("rqi-77")
        );
        let payload: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload["m2m:sgn"]["net"], 3);
    }

    #[tokio::test]
    async fn test_unreachable_http_target_fails_at_send() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = notifier()
            .notify(NotificationTarget::new(
                format!("http://{}/n", addr),
                json!({}),
                "InCSE1",
            ))
            .await;
        assert_eq!(outcome.failed_at, Some(TxStage::Send));
    }

    #[tokio::test]
    async fn test_disabled_configuration_fails_at_send() {
        let mut dtls = ProtocolClientConfig::plain();
        dtls.security = crate::config::SecurityMode::Certificate;
        let notifier = notifier().with_config(Protocol::Coap, dtls);

        let outcome = notifier
            .notify(NotificationTarget::new("coap://127.0.0.1/n", json!({}), "InCSE1"))
            .await;
        assert_eq!(outcome.failed_at, Some(TxStage::Send));
    }
}
