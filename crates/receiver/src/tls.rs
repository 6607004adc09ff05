//! TLS setup for the cast channel listener.
//!
//! The listener presents the manifest's peer certificate (`pu`/`pr`).
//! Senders do not verify it against the web PKI; the device proves itself
//! at the Cast layer via the device-auth challenge.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::manifest::Manifest;

/// Build a `rustls::ServerConfig` from the manifest's peer certificate and
/// private key.
pub fn server_config(manifest: &Manifest) -> Result<ServerConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut manifest.peer_cert.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to parse manifest 'pu' certificate PEM")?;

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut manifest.peer_key.as_bytes())
            .context("Failed to parse manifest 'pr' private key PEM")?
            .context("No private key found in manifest 'pr'")?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;

    Ok(config)
}

pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_manifest() -> Manifest {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["receiver.local".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        Manifest {
            peer_cert: cert.pem(),
            peer_key: key.serialize_pem(),
            device_cert: String::new(),
            intermediate_ca: String::new(),
            signature: String::new(),
        }
    }

    #[test]
    fn server_config_from_manifest() {
        let manifest = self_signed_manifest();
        assert!(server_config(&manifest).is_ok());
    }

    #[test]
    fn server_config_rejects_missing_key() {
        let mut manifest = self_signed_manifest();
        manifest.peer_key = String::new();
        assert!(server_config(&manifest).is_err());
    }
}
