//! Startup validation of transport configuration.
//!
//! Each transport is checked on its own, in a fixed order, and the first
//! failure is reported:
//!
//! 1. server configuration present
//! 2. port in `1..=65535`
//! 3. security level other than L2
//! 4. secure notifier has trust material
//! 5. secure router has trust material
//!
//! A failing transport is not started; the others are unaffected.

use crate::config::{ConfigError, PluginSection, SecuritySection, TransportConfig};
use iotdm_protocol::{Protocol, SecurityLevel};

/// Direction a client plugin serves, used in messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plugin {
    Notifier,
    Router,
}

impl Plugin {
    fn as_str(&self) -> &'static str {
        match self {
            Plugin::Notifier => "notifier",
            Plugin::Router => "router",
        }
    }
}

/// Validates the configuration of one transport.
pub fn validate(protocol: Protocol, config: &TransportConfig) -> Result<(), ConfigError> {
    let server = config.server.as_ref().ok_or_else(|| {
        invalid(protocol, "Server configuration not provided".to_string())
    })?;
    if server.port == 0 {
        return Err(invalid(
            protocol,
            format!("Invalid port number: {}", server.port),
        ));
    }
    if server.level == SecurityLevel::L2 {
        return Err(invalid(
            protocol,
            "Security level L2 is not supported by this module".to_string(),
        ));
    }
    check_plugin(protocol, Plugin::Notifier, &config.notifier, &config.security)?;
    check_plugin(protocol, Plugin::Router, &config.router, &config.security)?;
    Ok(())
}

fn check_plugin(
    protocol: Protocol,
    plugin: Plugin,
    section: &PluginSection,
    security: &SecuritySection,
) -> Result<(), ConfigError> {
    if !section.secure_connection {
        return Ok(());
    }
    if section.use_preshared_keys {
        if security.psk.is_empty() {
            return Err(invalid(
                protocol,
                format!(
                    "Secure connection using PSK enabled for {} but PSK is not configured",
                    plugin.as_str()
                ),
            ));
        }
        return Ok(());
    }
    match &security.trust_store {
        None => Err(invalid(
            protocol,
            format!(
                "Secure connection enabled for {} but TrustStore is not configured",
                plugin.as_str()
            ),
        )),
        Some(trust_store) if !trust_store.has_certificates() => Err(invalid(
            protocol,
            "Trust store configuration without list of trusted certificates".to_string(),
        )),
        Some(_) => Ok(()),
    }
}

fn invalid(protocol: Protocol, message: String) -> ConfigError {
    ConfigError::ValidationError(format!("{}: {}", protocol, message))
}
