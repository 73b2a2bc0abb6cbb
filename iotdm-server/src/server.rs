//! State shared by the transport servers.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::{Registration, RegistrationId, TransportRegistry};
use async_trait::async_trait;
use iotdm_protocol::Protocol;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// An inbound transport: HTTP, CoAP or the MQTT binding.
#[async_trait]
pub trait TransportServer: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Serves until [`TransportServer::shutdown`] is called.
    async fn run(&self) -> Result<(), ServerError>;

    fn shutdown(&self);

    fn is_running(&self) -> bool;
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Lifecycle bookkeeping of one server.
pub(crate) struct ServerState {
    protocol: Protocol,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) metrics: Option<Arc<Metrics>>,
}

impl ServerState {
    pub(crate) fn new(protocol: Protocol) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            protocol,
            shutdown,
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            stats: Arc::new(ServerStats::default()),
            metrics: None,
        }
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Marks the server as serving. `addr` is the bound socket, if it owns one.
    pub(crate) fn started(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock() = addr;
        self.running.store(true, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics
                .transports_active
                .with_label_values(&[self.protocol.as_str()])
                .set(1.0);
        }
    }

    pub(crate) fn stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics
                .transports_active
                .with_label_values(&[self.protocol.as_str()])
                .set(0.0);
        }
    }

    pub(crate) fn connection_accepted(&self) {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics
                .connections_total
                .with_label_values(&[self.protocol.as_str()])
                .inc();
        }
    }
}

/// Holds a registry entry for the lifetime of a running server.
pub(crate) struct RegistrationGuard<'a> {
    registry: &'a TransportRegistry,
    id: Option<RegistrationId>,
}

impl<'a> RegistrationGuard<'a> {
    pub(crate) fn acquire(
        registry: &'a TransportRegistry,
        registration: Registration,
    ) -> Result<Self, ServerError> {
        let id = registry.register(registration)?;
        Ok(Self {
            registry,
            id: Some(id),
        })
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.id.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotdm_protocol::SecurityLevel;

    #[test]
    fn test_guard_unregisters() {
        let registry = TransportRegistry::new();
        {
            let _guard = RegistrationGuard::acquire(
                &registry,
                Registration::exclusive(Protocol::Coap, 5683, SecurityLevel::L0),
            )
            .unwrap();
            assert!(registry.is_registered(Protocol::Coap, 5683));

            let clash = RegistrationGuard::acquire(
                &registry,
                Registration::exclusive(Protocol::Coap, 5683, SecurityLevel::L0),
            );
            assert!(matches!(clash, Err(ServerError::Registration(_))));
        }
        assert!(!registry.is_registered(Protocol::Coap, 5683));
    }

    #[test]
    fn test_state_lifecycle() {
        let mut state = ServerState::new(Protocol::Http);
        let metrics = Arc::new(Metrics::new().unwrap());
        state.metrics = Some(Arc::clone(&metrics));

        assert!(!state.is_running());
        state.started(Some("127.0.0.1:8282".parse().unwrap()));
        assert!(state.is_running());
        assert_eq!(state.local_addr().unwrap().port(), 8282);
        state.connection_accepted();
        assert_eq!(state.stats.connections_total.load(Ordering::Relaxed), 1);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains(r#"iotdm_transports_active{protocol="http"} 1"#));

        state.stopped();
        assert!(!state.is_running());
    }
}
