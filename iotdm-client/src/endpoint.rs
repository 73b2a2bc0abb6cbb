//! Destination URL parsing.
//!
//! Supported forms:
//!
//! ```text
//! http[s]://host[:port]/path[?query]
//! coap[s]://host[:port]/path[?query]
//! mqtt:/topic                      default broker
//! mqtt://host[:port]/topic         explicit broker
//! ```

use crate::error::ClientError;
use iotdm_protocol::{Protocol, DEFAULT_MQTT_PORT};
use std::fmt;

/// Parsed destination of an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub secure: bool,
    /// `None` only for MQTT URLs that use the default broker.
    pub host: Option<String>,
    pub port: u16,
    /// Path (HTTP, CoAP) or topic (MQTT), always starting with `/`.
    pub path: String,
    pub query: Option<String>,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once(':')
            .ok_or_else(|| ClientError::InvalidTarget(format!("missing scheme: {}", url)))?;
        let protocol = Protocol::from_scheme(scheme)
            .ok_or_else(|| ClientError::InvalidTarget(format!("unsupported scheme: {}", url)))?;
        let secure = scheme.ends_with('s') || scheme.ends_with('S');

        if let Some(after) = rest.strip_prefix("//") {
            let (authority, path_and_query) = match after.find('/') {
                Some(idx) => after.split_at(idx),
                None => (after, "/"),
            };
            let (host, port) = split_authority(authority, default_port(protocol, secure), url)?;
            let (path, query) = split_query(path_and_query);
            Ok(Self {
                protocol,
                secure,
                host: Some(host),
                port,
                path,
                query,
            })
        } else if protocol == Protocol::Mqtt && rest.starts_with('/') {
            Ok(Self {
                protocol,
                secure,
                host: None,
                port: DEFAULT_MQTT_PORT,
                path: rest.to_string(),
                query: None,
            })
        } else {
            Err(ClientError::InvalidTarget(format!("invalid URL: {}", url)))
        }
    }

    /// `host:port`, or `None` for the default MQTT broker.
    pub fn authority(&self) -> Option<String> {
        self.host.as_ref().map(|host| {
            if host.contains(':') {
                format!("[{}]:{}", host, self.port)
            } else {
                format!("{}:{}", host, self.port)
            }
        })
    }

    /// Path plus query, as sent in an HTTP request line.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match (self.protocol, self.secure) {
            (Protocol::Http, false) => "http",
            (Protocol::Http, true) => "https",
            (Protocol::Coap, false) => "coap",
            (Protocol::Coap, true) => "coaps",
            (Protocol::Mqtt, false) => "mqtt",
            (Protocol::Mqtt, true) => "mqtts",
        };
        match self.authority() {
            Some(authority) => write!(f, "{}://{}{}", scheme, authority, self.path_and_query()),
            None => write!(f, "{}:{}", scheme, self.path),
        }
    }
}

fn default_port(protocol: Protocol, secure: bool) -> u16 {
    match (protocol, secure) {
        (Protocol::Http, false) => 80,
        (Protocol::Http, true) => 443,
        (Protocol::Coap, false) => 5683,
        (Protocol::Coap, true) => 5684,
        (Protocol::Mqtt, false) => DEFAULT_MQTT_PORT,
        (Protocol::Mqtt, true) => 8883,
    }
}

fn split_authority(authority: &str, default: u16, url: &str) -> Result<(String, u16), ClientError> {
    let invalid = || ClientError::InvalidTarget(format!("invalid host in URL: {}", url));

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        (host, tail.strip_prefix(':'))
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| ClientError::InvalidTarget(format!("invalid port in URL: {}", url)))?,
        None => default,
    };
    Ok((host.to_string(), port))
}

fn split_query(path_and_query: &str) -> (String, Option<String>) {
    match path_and_query.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (path_and_query.to_string(), None),
    }
}
