//! Device authentication.
//!
//! A sender proves it is talking to a real receiver by sending a challenge
//! on `urn:x-cast:com.google.cast.tp.deviceauth`; the receiver answers with
//! the manifest signature and certificate chain. Senders accept either a
//! SHA-256 or SHA-1 signature, but the response must declare which one the
//! manifest actually carries, so the hash is detected by verifying the
//! signature against the peer certificate's DER bytes.
//!
//! Auth is always handled on the receiving connection, never forwarded —
//! relay mode included.

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use castellan_protocol::channel::{
    AuthResponse, CastMessage, DeviceAuthMessage, HashAlgorithm, NS_DEVICE_AUTH,
    SignatureAlgorithm,
};
use prost::Message;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::manifest::Manifest;

/// Handle a message on the device-auth namespace.
///
/// Returns the reply to send on the same connection, or `None` when the
/// message carries no challenge.
pub fn handle_challenge(
    message: &CastMessage,
    manifest: &Manifest,
) -> Result<Option<CastMessage>> {
    let payload = message
        .payload_binary
        .as_deref()
        .context("device auth message has no binary payload")?;
    let auth = DeviceAuthMessage::decode(payload).context("failed to decode device auth message")?;

    if auth.challenge.is_none() {
        return Ok(None);
    }

    let reply = DeviceAuthMessage {
        challenge: None,
        response: Some(build_response(manifest)?),
        error: None,
    };

    Ok(Some(CastMessage::binary(
        NS_DEVICE_AUTH,
        &message.destination_id,
        &message.source_id,
        reply.encode_to_vec(),
    )))
}

fn build_response(manifest: &Manifest) -> Result<AuthResponse> {
    let peer_der = pem::parse(&manifest.peer_cert)
        .context("manifest 'pu' is not valid PEM")?
        .into_contents();
    let device_der = pem::parse(&manifest.device_cert)
        .context("manifest 'cpu' is not valid PEM")?
        .into_contents();
    let ica_der = pem::parse(&manifest.intermediate_ca)
        .context("manifest 'ica' is not valid PEM")?
        .into_contents();
    let signature = BASE64
        .decode(manifest.signature.trim())
        .context("manifest 'sig' is not valid base64")?;

    let hash = match device_public_key(&device_der)
        .map(|key| detect_hash(&key, &peer_der, &signature))
    {
        Ok(Some(hash)) => hash,
        Ok(None) => {
            tracing::warn!("signature does not verify with SHA-256 or SHA-1, reporting SHA-1");
            HashAlgorithm::Sha1
        }
        Err(e) => {
            tracing::warn!("cannot check manifest signature, reporting SHA-1: {e:#}");
            HashAlgorithm::Sha1
        }
    };

    Ok(AuthResponse {
        signature,
        client_auth_certificate: device_der,
        intermediate_certificate: vec![ica_der],
        signature_algorithm: Some(SignatureAlgorithm::RsassaPkcs1v15 as i32),
        sender_nonce: None,
        hash_algorithm: Some(hash as i32),
        crl: Some(Vec::new()),
    })
}

/// Determine which hash the manifest signature was made with by verifying
/// it over `signed_data`, trying SHA-256 before SHA-1.
pub fn detect_hash(
    public_key: &RsaPublicKey,
    signed_data: &[u8],
    signature: &[u8],
) -> Option<HashAlgorithm> {
    let digest = Sha256::digest(signed_data);
    if public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
    {
        return Some(HashAlgorithm::Sha256);
    }

    let digest = Sha1::digest(signed_data);
    if public_key
        .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
        .is_ok()
    {
        return Some(HashAlgorithm::Sha1);
    }

    None
}

/// Pull the RSA public key out of the device certificate.
fn device_public_key(cert_der: &[u8]) -> Result<RsaPublicKey> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| anyhow!("failed to parse device certificate: {e}"))?;
    RsaPublicKey::from_public_key_der(cert.public_key().raw)
        .context("device certificate does not carry an RSA public key")
}
