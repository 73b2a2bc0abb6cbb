//! TLS configuration and acceptor for the HTTPS server.

use crate::config::{SecuritySection, ServerSection};
use crate::error::ServerError;
use iotdm_client::tls::{load_certs, load_private_key};
use iotdm_client::{ClientError, KeyStore};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

fn tls_error(err: ClientError) -> ServerError {
    match err {
        ClientError::TlsConfig(message) => ServerError::TlsConfig(message),
        other => ServerError::TlsConfig(other.to_string()),
    }
}

/// Builds the acceptor from the transport's key store, and from its trust
/// store when client certificates are required.
pub fn create_tls_acceptor(
    server: &ServerSection,
    security: &SecuritySection,
) -> Result<TlsAcceptor, ServerError> {
    let (cert_path, key_path) = match &security.key_store {
        Some(KeyStore {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            password,
        }) => {
            if password.is_some() {
                return Err(ServerError::TlsConfig(
                    "encrypted key stores are not supported, provide an unencrypted PEM key".into(),
                ));
            }
            (cert_path, key_path)
        }
        _ => {
            return Err(ServerError::TlsConfig(
                "key store with cert_path and key_path is required for TLS".into(),
            ))
        }
    };

    // Check mTLS config early
    let client_roots = if server.require_client_cert {
        let trust = security
            .trust_store
            .as_ref()
            .filter(|t| t.has_certificates())
            .ok_or_else(|| {
                ServerError::TlsConfig("trust store not set for client certificates".into())
            })?;
        let mut roots = RootCertStore::empty();
        for path in trust.path.iter().chain(trust.trusted_certificates.iter()) {
            for cert in load_certs(path).map_err(tls_error)? {
                roots
                    .add(cert)
                    .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
            }
        }
        Some(roots)
    } else {
        None
    };

    let certs = load_certs(cert_path).map_err(tls_error)?;
    let key = load_private_key(key_path).map_err(tls_error)?;

    let server_config = match client_roots {
        Some(roots) => {
            let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, key)
                .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?
        }
        None => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?,
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
