//! Gateway configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via IOTDM_CONFIG)
//! 3. Environment variables

use iotdm_client::{KeyStore, PoolSettings, ProtocolClientConfig, SecurityMode, TrustStore};
use iotdm_protocol::{Protocol, SecurityLevel, DEFAULT_COAP_PORT, DEFAULT_HTTP_PORT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local CSE identity and routing table.
    pub cse: CseConfig,
    pub http: TransportConfig,
    pub coap: TransportConfig,
    /// MQTT binding. The server section names the broker.
    pub mqtt: TransportConfig,
    /// Outbound client settings.
    pub client: ClientConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cse: CseConfig::default(),
            http: TransportConfig::serving(DEFAULT_HTTP_PORT),
            coap: TransportConfig::serving(DEFAULT_COAP_PORT),
            mqtt: TransportConfig::default(),
            client: ClientConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("IOTDM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.cse.apply_env_overrides();
        if let Some(port) = env_parse("IOTDM_HTTP_PORT") {
            self.http.server_or_default(DEFAULT_HTTP_PORT).port = port;
        }
        if let Some(port) = env_parse("IOTDM_COAP_PORT") {
            self.coap.server_or_default(DEFAULT_COAP_PORT).port = port;
        }
        if let Ok(broker) = std::env::var("IOTDM_MQTT_BROKER") {
            let (host, port) = match broker.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().ok()),
                None => (broker.clone(), None),
            };
            let server = self.mqtt.server_or_default(iotdm_protocol::DEFAULT_MQTT_PORT);
            server.host = host;
            if let Some(port) = port {
                server.port = port;
            }
        }
        self.client.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Configuration of one transport.
    pub fn transport(&self, protocol: Protocol) -> &TransportConfig {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Coap => &self.coap,
            Protocol::Mqtt => &self.mqtt,
        }
    }

    /// Client pool settings derived from the MQTT broker and client sections.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            default_mqtt_broker: self
                .mqtt
                .server
                .as_ref()
                .map(|server| format!("{}:{}", server.host, server.port)),
            client_id_prefix: self.client.client_id_prefix.clone(),
            request_timeout: self.client.request_timeout(),
        }
    }
}

/// Local CSE identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CseConfig {
    /// Resource name of the cseBase.
    pub name: String,
    /// CSE-ID, used as originator of outbound requests.
    pub cse_id: String,
    /// Next hop URL by remote CSE-ID.
    pub routes: BTreeMap<String, String>,
}

impl Default for CseConfig {
    fn default() -> Self {
        Self {
            name: "InCSE1".to_string(),
            cse_id: "in-cse".to_string(),
            routes: BTreeMap::new(),
        }
    }
}

impl CseConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("IOTDM_CSE_BASE") {
            if !name.trim().is_empty() {
                self.name = name.trim().to_string();
            }
        }
        if let Ok(id) = std::env::var("IOTDM_CSE_ID") {
            if !id.trim().is_empty() {
                self.cse_id = id.trim().to_string();
            }
        }
    }
}

/// Server, notifier, router and security sections of one transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Inbound server; `None` leaves the transport unconfigured.
    pub server: Option<ServerSection>,
    pub notifier: PluginSection,
    pub router: PluginSection,
    pub security: SecuritySection,
}

impl TransportConfig {
    /// A plain server on `port` with default client sections.
    pub fn serving(port: u16) -> Self {
        Self {
            server: Some(ServerSection::new(port)),
            ..Self::default()
        }
    }

    fn server_or_default(&mut self, port: u16) -> &mut ServerSection {
        self.server.get_or_insert_with(|| ServerSection::new(port))
    }

    /// Client configuration used for notifications over this transport.
    pub fn notifier_client_config(&self) -> ProtocolClientConfig {
        self.client_config(&self.notifier)
    }

    /// Client configuration used for routed requests over this transport.
    pub fn router_client_config(&self) -> ProtocolClientConfig {
        self.client_config(&self.router)
    }

    /// Client configuration of the MQTT binding's broker connection.
    pub fn broker_client_config(&self) -> ProtocolClientConfig {
        let secure = self
            .server
            .as_ref()
            .is_some_and(|server| server.level >= SecurityLevel::L1);
        if !secure {
            return ProtocolClientConfig::default();
        }
        let config = match self.security.trust_store.as_ref().filter(|t| t.has_certificates()) {
            Some(trust_store) => ProtocolClientConfig::certificate(trust_store.clone()),
            // web PKI roots
            None => ProtocolClientConfig {
                security: SecurityMode::Certificate,
                level: SecurityLevel::L1,
                use_default: false,
                ..ProtocolClientConfig::default()
            },
        };
        match &self.security.key_store {
            Some(key_store) => config.with_key_store(key_store.clone()),
            None => config,
        }
    }

    fn client_config(&self, plugin: &PluginSection) -> ProtocolClientConfig {
        if !plugin.secure_connection {
            return ProtocolClientConfig::default();
        }
        let config = if plugin.use_preshared_keys {
            ProtocolClientConfig::pre_shared_key(self.security.psk.clone())
        } else {
            ProtocolClientConfig::certificate(self.security.trust_store.clone().unwrap_or_default())
        };
        match &self.security.key_store {
            Some(key_store) => config.with_key_store(key_store.clone()),
            None => config,
        }
    }
}

/// Inbound server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Bind address (HTTP, CoAP) or broker host (MQTT).
    pub host: String,
    pub port: u16,
    /// Minimum transport security accepted from requesters.
    pub level: SecurityLevel,
    /// Require and verify client certificates (HTTPS only).
    pub require_client_cert: bool,
}

impl ServerSection {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Listener address for HTTP and CoAP.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{}:{}", host, self.port).parse().map_err(|e| {
            ConfigError::ValidationError(format!(
                "invalid bind address {}:{}: {}",
                self.host, self.port, e
            ))
        })
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            level: SecurityLevel::L0,
            require_client_cert: false,
        }
    }
}

/// Notifier or router plugin settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    pub secure_connection: bool,
    /// Secure with pre-shared keys instead of certificates.
    pub use_preshared_keys: bool,
}

/// Security material of one transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Local certificate and key (server identity, client auth).
    pub key_store: Option<KeyStore>,
    pub trust_store: Option<TrustStore>,
    /// Pre-shared keys by remote identity.
    pub psk: BTreeMap<String, String>,
}

/// Outbound client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_id_prefix: String,
    /// Response timeout for routed requests in milliseconds (0 = wait indefinitely).
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "iotdm".to_string(),
            request_timeout_ms: 0,
        }
    }
}

impl ClientConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("IOTDM_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = ms;
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("IOTDM_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Some(addr) = env_parse("IOTDM_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for iotdm_protocol::GatewayError {
    fn from(err: ConfigError) -> Self {
        iotdm_protocol::GatewayError::Config(err.to_string())
    }
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cse.name, "InCSE1");
        assert_eq!(config.http.server.as_ref().unwrap().port, 8282);
        assert_eq!(config.coap.server.as_ref().unwrap().port, 5683);
        assert!(config.mqtt.server.is_none());
        assert!(!config.metrics.enabled);
        assert_eq!(config.pool_settings().default_mqtt_broker, None);
        assert_eq!(config.client.request_timeout(), None);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
cse:
  name: GatewayCSE
  cse_id: gw-cse
  routes:
    remote-cse: http://10.0.0.2:8282/
http:
  server:
    port: 8080
    level: L1
  notifier:
    secure_connection: true
  security:
    trust_store:
      path: /etc/iotdm/ca.pem
mqtt:
  server:
    host: broker.local
    port: 1884
client:
  request_timeout_ms: 2500
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.cse.cse_id, "gw-cse");
        assert_eq!(
            config.cse.routes.get("remote-cse").map(String::as_str),
            Some("http://10.0.0.2:8282/")
        );
        let http = config.http.server.as_ref().unwrap();
        assert_eq!((http.port, http.level), (8080, SecurityLevel::L1));
        assert_eq!(http.host, "0.0.0.0");
        // sections absent from the file keep their defaults
        assert_eq!(config.coap.server.as_ref().unwrap().port, 5683);

        let settings = config.pool_settings();
        assert_eq!(settings.default_mqtt_broker.as_deref(), Some("broker.local:1884"));
        assert_eq!(settings.request_timeout, Some(Duration::from_millis(2500)));

        let notifier = config.http.notifier_client_config();
        assert_eq!(notifier.security, SecurityMode::Certificate);
        assert!(notifier.trust_store.unwrap().has_certificates());
        assert_eq!(config.http.router_client_config(), ProtocolClientConfig::default());
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cse: 42").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::ParseError(_, _))
        ));
        assert!(matches!(
            Config::from_file("/nonexistent/iotdm.yaml"),
            Err(ConfigError::IoError(_, _))
        ));
    }

    #[test]
    fn test_psk_mapping() {
        let mut transport = TransportConfig::serving(5683);
        transport.router = PluginSection {
            secure_connection: true,
            use_preshared_keys: true,
        };
        transport.security.psk.insert("remote".into(), "secret".into());

        let config = transport.router_client_config();
        assert_eq!(config.security, SecurityMode::PreSharedKey);
        assert_eq!(config.psk.get("remote").map(String::as_str), Some("secret"));
        assert!(!config.use_default);
    }

    #[test]
    fn test_broker_client_config() {
        let mut mqtt = TransportConfig::serving(1883);
        assert!(!mqtt.broker_client_config().is_secure());

        if let Some(server) = mqtt.server.as_mut() {
            server.level = SecurityLevel::L1;
        }
        let secure = mqtt.broker_client_config();
        assert_eq!(secure.security, SecurityMode::Certificate);
        assert!(!secure.use_default);
        assert_ne!(secure, ProtocolClientConfig::default());
    }

    #[test]
    fn test_bind_addr() {
        let server = ServerSection::new(8282);
        assert_eq!(server.bind_addr().unwrap().port(), 8282);

        let server = ServerSection {
            host: "::1".into(),
            ..ServerSection::new(1)
        };
        assert!(server.bind_addr().unwrap().is_ipv6());
    }
}
