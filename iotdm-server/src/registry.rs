//! Transport registry.
//!
//! Every inbound server registers its (protocol, port, security) handler
//! here before binding. An `Exclusive` registration owns its port; `Shared`
//! registrations coexist with other `Shared` ones using the same security.

use iotdm_protocol::{Protocol, SecurityLevel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// How a handler binds its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    Exclusive,
    Shared,
}

/// A handler registration request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    pub protocol: Protocol,
    pub port: u16,
    pub security: SecurityLevel,
    pub binding: Binding,
    /// Owner name used in logs and errors.
    pub owner: String,
}

impl Registration {
    pub fn exclusive(protocol: Protocol, port: u16, security: SecurityLevel) -> Self {
        Self {
            protocol,
            port,
            security,
            binding: Binding::Exclusive,
            owner: format!("{} server", protocol),
        }
    }

    pub fn shared(protocol: Protocol, port: u16, security: SecurityLevel) -> Self {
        Self {
            binding: Binding::Shared,
            ..Self::exclusive(protocol, port, security)
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    fn conflicts_with(&self, other: &Registration) -> bool {
        if self.protocol != other.protocol || self.port != other.port {
            return false;
        }
        match (self.binding, other.binding) {
            (Binding::Shared, Binding::Shared) => self.security != other.security,
            _ => true,
        }
    }
}

/// Identifies an accepted registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// Registration conflicts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("{protocol} port {port} already registered by {owner}")]
    Conflict {
        protocol: Protocol,
        port: u16,
        owner: String,
    },
}

/// Registry of active transport handlers.
#[derive(Default)]
pub struct TransportRegistry {
    entries: Mutex<HashMap<RegistrationId, Registration>>,
    next_id: AtomicU64,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, or reports the registration it conflicts with.
    pub fn register(&self, registration: Registration) -> Result<RegistrationId, RegistrationError> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.values().find(|e| e.conflicts_with(&registration)) {
            return Err(RegistrationError::Conflict {
                protocol: registration.protocol,
                port: registration.port,
                owner: existing.owner.clone(),
            });
        }
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            "Registered {} ({} port {}, {:?}, {})",
            registration.owner,
            registration.protocol,
            registration.port,
            registration.binding,
            registration.security
        );
        entries.insert(id, registration);
        Ok(id)
    }

    /// Removes a registration. Unknown or already removed ids are ignored.
    pub fn unregister(&self, id: Option<RegistrationId>) {
        let Some(id) = id else {
            return;
        };
        if let Some(registration) = self.entries.lock().remove(&id) {
            tracing::debug!(
                "Unregistered {} ({} port {})",
                registration.owner,
                registration.protocol,
                registration.port
            );
        }
    }

    pub fn is_registered(&self, protocol: Protocol, port: u16) -> bool {
        self.entries
            .lock()
            .values()
            .any(|e| e.protocol == protocol && e.port == port)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_owns_port() {
        let registry = TransportRegistry::new();
        registry
            .register(Registration::exclusive(Protocol::Http, 8282, SecurityLevel::L0))
            .unwrap();

        let err = registry
            .register(Registration::shared(Protocol::Http, 8282, SecurityLevel::L0))
            .unwrap_err();
        assert!(err.to_string().contains("http server"));

        // other protocols and ports are independent
        registry
            .register(Registration::exclusive(Protocol::Coap, 8282, SecurityLevel::L0))
            .unwrap();
        registry
            .register(Registration::exclusive(Protocol::Http, 8283, SecurityLevel::L0))
            .unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_shared_requires_same_security() {
        let registry = TransportRegistry::new();
        registry
            .register(Registration::shared(Protocol::Http, 8443, SecurityLevel::L1))
            .unwrap();
        registry
            .register(Registration::shared(Protocol::Http, 8443, SecurityLevel::L1).with_owner("second"))
            .unwrap();
        assert!(registry
            .register(Registration::shared(Protocol::Http, 8443, SecurityLevel::L0))
            .is_err());
        assert!(registry
            .register(Registration::exclusive(Protocol::Http, 8443, SecurityLevel::L1))
            .is_err());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = TransportRegistry::new();
        let id = registry
            .register(Registration::exclusive(Protocol::Coap, 5683, SecurityLevel::L0))
            .unwrap();

        registry.unregister(Some(id));
        registry.unregister(Some(id));
        // a registration that never succeeded
        registry.unregister(None);

        assert!(registry.is_empty());
        assert!(!registry.is_registered(Protocol::Coap, 5683));
        registry
            .register(Registration::exclusive(Protocol::Coap, 5683, SecurityLevel::L0))
            .unwrap();
    }
}
