//! Client security configuration.

use iotdm_protocol::SecurityLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// How an outbound connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    None,
    /// TLS (or DTLS for CoAP) with certificates.
    Certificate,
    /// TLS-PSK / DTLS-PSK keyed by remote identity.
    PreSharedKey,
}

/// Location of the local certificate chain and private key (PEM).
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStore {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Certificates trusted when verifying the remote side (PEM).
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustStore {
    /// Bundle of trusted certificates.
    pub path: Option<PathBuf>,
    pub password: Option<String>,
    /// Additional individually trusted certificate files.
    pub trusted_certificates: Vec<PathBuf>,
}

impl TrustStore {
    /// Returns true if at least one certificate source is configured.
    pub fn has_certificates(&self) -> bool {
        self.path.is_some() || !self.trusted_certificates.is_empty()
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("path", &self.path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("trusted_certificates", &self.trusted_certificates)
            .finish()
    }
}

/// Security configuration of one transport client.
///
/// Two configurations compare equal when every field matches, or when both
/// declare `use_default`. The client pool keys on this, so every caller that
/// asks for the default configuration shares one client.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolClientConfig {
    pub security: SecurityMode,
    pub key_store: Option<KeyStore>,
    pub trust_store: Option<TrustStore>,
    /// Pre-shared keys by remote identity.
    pub psk: BTreeMap<String, String>,
    pub level: SecurityLevel,
    pub use_default: bool,
}

impl ProtocolClientConfig {
    /// Plain (unsecured) configuration that is not the default.
    pub fn plain() -> Self {
        Self {
            use_default: false,
            ..Self::default()
        }
    }

    /// Certificate-based TLS with the given trust store.
    pub fn certificate(trust_store: TrustStore) -> Self {
        Self {
            security: SecurityMode::Certificate,
            trust_store: Some(trust_store),
            level: SecurityLevel::L1,
            use_default: false,
            ..Self::default()
        }
    }

    /// Pre-shared-key security with the given key table.
    pub fn pre_shared_key(psk: BTreeMap<String, String>) -> Self {
        Self {
            security: SecurityMode::PreSharedKey,
            psk,
            level: SecurityLevel::L1,
            use_default: false,
            ..Self::default()
        }
    }

    pub fn with_key_store(mut self, key_store: KeyStore) -> Self {
        self.key_store = Some(key_store);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.security != SecurityMode::None
    }

    /// Short label used in logs and metrics; never contains secrets.
    pub fn mode_label(&self) -> &'static str {
        match self.security {
            SecurityMode::None => "plain",
            SecurityMode::Certificate => "certificate",
            SecurityMode::PreSharedKey => "psk",
        }
    }
}

impl Default for ProtocolClientConfig {
    fn default() -> Self {
        Self {
            security: SecurityMode::None,
            key_store: None,
            trust_store: None,
            psk: BTreeMap::new(),
            level: SecurityLevel::L0,
            use_default: true,
        }
    }
}

impl PartialEq for ProtocolClientConfig {
    fn eq(&self, other: &Self) -> bool {
        if self.use_default && other.use_default {
            return true;
        }
        self.use_default == other.use_default
            && self.security == other.security
            && self.key_store == other.key_store
            && self.trust_store == other.trust_store
            && self.psk == other.psk
            && self.level == other.level
    }
}

impl Eq for ProtocolClientConfig {}

impl Hash for ProtocolClientConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.use_default.hash(state);
        if self.use_default {
            return;
        }
        self.security.hash(state);
        self.key_store.hash(state);
        self.trust_store.hash(state);
        self.psk.hash(state);
        self.level.hash(state);
    }
}

impl fmt::Debug for ProtocolClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClientConfig")
            .field("security", &self.security)
            .field("key_store", &self.key_store)
            .field("trust_store", &self.trust_store)
            .field("psk_identities", &self.psk.keys().collect::<Vec<_>>())
            .field("level", &self.level)
            .field("use_default", &self.use_default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(config: &ProtocolClientConfig) -> u64 {
        let mut hasher = DefaultHasher::new();
        config.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_default_configs_compare_equal() {
        let a = ProtocolClientConfig::default();
        let mut b = ProtocolClientConfig::default();
        b.security = SecurityMode::Certificate;
        b.level = SecurityLevel::L1;

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_explicit_configs_compare_fields() {
        let trust = TrustStore {
            path: Some("/etc/iotdm/ca.pem".into()),
            ..Default::default()
        };
        let a = ProtocolClientConfig::certificate(trust.clone());
        let b = ProtocolClientConfig::certificate(trust);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = ProtocolClientConfig::certificate(TrustStore::default());
        assert_ne!(a, c);
    }

    #[test]
    fn test_default_differs_from_explicit_plain() {
        assert_ne!(ProtocolClientConfig::default(), ProtocolClientConfig::plain());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut psk = BTreeMap::new();
        psk.insert("remote-cse".to_string(), "s3cr3t-key".to_string());
        let config = ProtocolClientConfig::pre_shared_key(psk).with_key_store(KeyStore {
            password: Some("hunter2".into()),
            ..Default::default()
        });

        let rendered = format!("{:?}", config);
        assert!(rendered.contains("remote-cse"));
        assert!(!rendered.contains("s3cr3t-key"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ProtocolClientConfig =
            serde_json::from_str(r#"{"security": "certificate", "use_default": false}"#).unwrap();
        assert_eq!(config.security, SecurityMode::Certificate);
        assert!(config.trust_store.is_none());
        assert!(config.is_secure());
    }
}
