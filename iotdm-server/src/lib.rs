//! # iotdm-server
//!
//! Inbound side of iotdm.
//!
//! This crate provides:
//! - HTTP, CoAP and MQTT transport servers
//! - Protocol adapters between native messages and oneM2M primitives
//! - The Rx pipeline over the resource store
//! - Transport registration and configuration validation
//! - Resource events and subscription notifications
//! - Prometheus metrics
//! - Optional TLS support

pub mod adapter;
pub mod coap_server;
pub mod config;
pub mod error;
pub mod events;
pub mod http_server;
pub mod metrics;
pub mod mqtt_server;
pub mod registry;
pub mod rx;
pub mod server;
pub mod stream;
pub mod tls;
pub mod validator;

pub use adapter::{Adapters, Inbound, Outbound, ProtocolAdapter};
pub use coap_server::CoapServer;
pub use config::{
    ClientConfig, Config, ConfigError, CseConfig, MetricsConfig, PluginSection, SecuritySection,
    ServerSection, TransportConfig,
};
pub use error::ServerError;
pub use events::{EventBroadcaster, EventKind, NotificationDispatcher, ResourceEvent};
pub use http_server::HttpServer;
pub use metrics::{run_metrics_server, Metrics};
pub use mqtt_server::MqttServer;
pub use registry::{Registration, RegistrationError, RegistrationId, TransportRegistry};
pub use rx::{RxPipeline, RxStage};
pub use server::{ServerStats, TransportServer};
pub use tls::create_tls_acceptor;
pub use validator::validate;
