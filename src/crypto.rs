//! # Transport Cryptography
//!
//! TLS plumbing that binds a [`PeerId`] to the QUIC session:
//!
//! - Self-signed Ed25519 certificates generated from the network key
//! - Custom client/server verifiers that accept exactly one key type and
//!   check the certificate's embedded public key against the expected peer
//! - [`extract_verified_peer_id`] to recover the authenticated identity of
//!   an established connection
//!
//! There is no CA. Trust is "the peer holds the private key for the PeerId
//! we dialed" (outbound) or "the peer holds *some* valid Ed25519 key, which
//! becomes its PeerId" (inbound). The `dangerous()` rustls APIs are used
//! deliberately for this identity-is-key model.
//!
//! Domain-separated signing helpers live here too; the node record is the
//! only current consumer.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Keypair, PeerId};

/// ALPN protocol identifier for all connections.
pub const ALPN: &[u8] = b"pharos/1";

/// Idle timeout applied to every QUIC connection. Longer than the metadata
/// ping interval would be wasteful; shorter than RESP_TIMEOUT would race it.
const TRANSPORT_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Parallel bidirectional streams a peer may hold open. This is the
/// multiplexer-level limit that naturally bounds inbound request concurrency
/// per peer.
const MAX_CONCURRENT_BIDI_STREAMS: u32 = 32;

/// Lazily-initialized crypto provider for rustls, backed by ring.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

// ============================================================================
// Signature Errors and Domains
// ============================================================================

/// Signature verification failures for signed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    VerificationFailed,
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Domain separation prefix for node record signatures.
pub const NODE_RECORD_SIGNATURE_DOMAIN: &[u8] = b"pharos-node-record-v1:";

/// Sign `data` with a domain prefix. Signatures from one domain can never be
/// replayed into another.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated Ed25519 signature.
pub fn verify_with_domain(
    peer_id: &PeerId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(peer_id.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Certificate Generation
// ============================================================================

/// Build a self-signed certificate whose SubjectPublicKeyInfo is the node's
/// Ed25519 public key. The peer id is recovered from this field on the other
/// side; the CN carries the hex id for debugging only.
pub fn generate_certificate(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    // Minimal PKCS#8 v1 wrapping of the raw Ed25519 seed.
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["pharos".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());
    Ok((vec![cert_der], key))
}

// ============================================================================
// QUIC Configs
// ============================================================================

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let client_cert_verifier = Arc::new(PeerCertVerifier);
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.migration(true);

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .expect("transport config is exclusively owned right after creation");
    transport_config.max_idle_timeout(Some(
        TRANSPORT_IDLE_TIMEOUT
            .try_into()
            .expect("idle timeout fits VarInt"),
    ));
    transport_config.max_concurrent_bidi_streams(MAX_CONCURRENT_BIDI_STREAMS.into());
    transport_config.max_concurrent_uni_streams(0u32.into());

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DialTargetCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;

    let mut client_crypto = client_crypto;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    Ok(client_config)
}

// ============================================================================
// Identity Extraction
// ============================================================================

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;
    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Recover the authenticated PeerId of an established connection from the
/// verified certificate chain. `None` means the handshake should not have
/// succeeded; callers drop the connection.
pub fn extract_verified_peer_id(connection: &quinn::Connection) -> Option<PeerId> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = extract_public_key_from_cert(cert_der)?;
    let id = PeerId::from_bytes(public_key);
    id.is_valid().then_some(id)
}

/// Encode a PeerId as the SNI for an outbound dial. Hex of 32 bytes is 64
/// chars, one over the DNS label limit, so it is split into two labels.
pub(crate) fn peer_id_to_sni(peer_id: &PeerId) -> String {
    let hex = peer_id.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_peer_id_from_sni(sni: &str) -> Option<PeerId> {
    let hex_str: String = sni.split('.').collect();
    let bytes = hex::decode(&hex_str).ok()?;
    let arr: [u8; 32] = bytes.as_slice().try_into().ok()?;
    Some(PeerId::from_bytes(arr))
}

// ============================================================================
// Verifiers
// ============================================================================

/// Server-side verifier for inbound peers: any valid Ed25519 key is
/// accepted, and it becomes the peer's identity.
#[derive(Debug)]
struct PeerCertVerifier;

impl rustls::server::danger::ClientCertVerifier for PeerCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;
        if !PeerId::from_bytes(public_key).is_valid() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Client-side verifier for outbound dials: the certificate's public key
/// must match the PeerId we encoded into the SNI.
#[derive(Debug)]
struct DialTargetCertVerifier;

impl rustls::client::danger::ServerCertVerifier for DialTargetCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ));
            }
        };

        let expected = parse_peer_id_from_sni(sni).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;

        let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;

        if PeerId::from_bytes(public_key) != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn certificate_embeds_peer_id() {
        let keypair = Keypair::generate();
        let (certs, _key) = generate_certificate(&keypair).expect("cert generation");
        let extracted = extract_public_key_from_cert(certs[0].as_ref()).expect("pk extraction");
        assert_eq!(extracted, keypair.public_key_bytes());
    }

    #[test]
    fn sni_round_trips_peer_id() {
        let id = Keypair::generate().peer_id();
        let sni = peer_id_to_sni(&id);
        assert_eq!(parse_peer_id_from_sni(&sni), Some(id));
        for label in sni.split('.') {
            assert!(label.len() <= 63, "DNS label limit");
        }
    }

    #[test]
    fn domain_separation_rejects_cross_domain_signatures() {
        let keypair = Keypair::generate();
        let id = keypair.peer_id();
        let sig = sign_with_domain(&keypair, NODE_RECORD_SIGNATURE_DOMAIN, b"payload");

        assert!(verify_with_domain(&id, NODE_RECORD_SIGNATURE_DOMAIN, b"payload", &sig).is_ok());
        assert_eq!(
            verify_with_domain(&id, b"other-domain:", b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_with_domain(&id, NODE_RECORD_SIGNATURE_DOMAIN, b"payload", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&id, NODE_RECORD_SIGNATURE_DOMAIN, b"payload", &[0u8; 63]),
            Err(SignatureError::InvalidLength)
        );
    }
}
