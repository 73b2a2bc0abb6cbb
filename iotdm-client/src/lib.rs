//! # iotdm-client
//!
//! Outbound side of iotdm.
//!
//! This crate provides:
//! - The Tx pipeline and protocol-tagged Tx requests
//! - HTTP, CoAP and MQTT transport clients
//! - A client pool keyed by transport and security configuration
//! - Notification and inter-CSE routing front-ends
//! - Optional TLS support

pub mod coap;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod notifier;
pub mod pool;
pub mod request;
pub mod router;
pub mod stream;
pub mod tls;
pub mod tx;

pub use config::{KeyStore, ProtocolClientConfig, SecurityMode, TrustStore};
pub use endpoint::Endpoint;
pub use error::ClientError;
pub use mqtt::{MqttClient, MqttOptions};
pub use notifier::{NotificationTarget, Notifier};
pub use pool::{ClientKey, ClientPool, PoolSettings, TransportClient};
pub use request::{TxContext, TxJob, TxPurpose, TxRequest};
pub use router::Router;
pub use tx::{TxHooks, TxOutcome, TxPipeline, TxStage};
