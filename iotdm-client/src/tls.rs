//! TLS connector construction for outbound clients.

use crate::config::{KeyStore, ProtocolClientConfig, SecurityMode, TrustStore};
use crate::error::ClientError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Creates a TLS connector for a secured client configuration.
///
/// Only certificate mode is supported; PSK fails with
/// [`ClientError::UnsupportedSecurity`].
pub fn create_tls_connector(config: &ProtocolClientConfig) -> Result<TlsConnector, ClientError> {
    match config.security {
        SecurityMode::Certificate => {}
        SecurityMode::PreSharedKey => {
            return Err(ClientError::UnsupportedSecurity("TLS-PSK".into()));
        }
        SecurityMode::None => {
            return Err(ClientError::TlsConfig(
                "TLS requested for an unsecured configuration".into(),
            ));
        }
    }

    let root_store = match &config.trust_store {
        Some(trust) if !config.use_default => load_trust_store(trust)?,
        _ => {
            let mut store = RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        }
    };

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
    let client_config = match &config.key_store {
        Some(KeyStore {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            password,
        }) => {
            if password.is_some() {
                return Err(ClientError::TlsConfig(
                    "encrypted key stores are not supported, provide an unencrypted PEM key"
                        .into(),
                ));
            }
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

fn load_trust_store(trust: &TrustStore) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    let sources = trust.path.iter().chain(trust.trusted_certificates.iter());
    for path in sources {
        for cert in load_certs(path)? {
            store
                .add(cert)
                .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert {:?}: {}", path, e)))?;
        }
    }
    if store.is_empty() {
        return Err(ClientError::TlsConfig(
            "trust store contains no certificates".into(),
        ));
    }
    Ok(store)
}

/// Reads every PEM certificate in a file; an empty file is an error.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ClientError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// Reads the first PKCS#1, PKCS#8 or SEC1 key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ClientError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}
