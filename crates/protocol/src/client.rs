//! Dialing another cast device.
//!
//! Used by the sender binary and by the receiver's relay mode. The TLS
//! handshake accepts any certificate; a cast peer is authenticated at the
//! Cast layer through the device-auth challenge, not the web PKI.

use std::sync::Arc;

use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring::default_provider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::frame::CastChannel;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("invalid peer name '{0}'")]
    BadPeerName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Open a cast channel to `host:port` over TLS.
pub async fn dial(host: &str, port: u16) -> Result<CastChannel, DialError> {
    let tcp = TcpStream::connect((host, port)).await?;

    let name = ServerName::try_from(host.to_string())
        .map_err(|_| DialError::BadPeerName(host.to_string()))?;
    let connector = TlsConnector::from(Arc::new(client_config()));
    let tls = connector.connect(name, tcp).await?;

    Ok(CastChannel::spawn(tls))
}

/// Client config that skips certificate verification.
pub fn client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
