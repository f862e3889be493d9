//! # Transport Security
//!
//! Every node generates a self-signed Ed25519 certificate from its keypair and
//! both sides of a QUIC connection present one (mutual TLS).
//!
//! Peers are dialed by address, not by key, so certificate verification checks
//! that the certificate carries a well-formed Ed25519 key and that the handshake
//! signature is valid for it. The key is recorded for logging; mesh identifiers
//! travel inside the messages themselves.
//!
//! The ALPN protocol "tapestry" keeps other QUIC services from talking to us by
//! accident. Only Ed25519 signatures are accepted.
//!
//! The `dangerous()` rustls APIs are used because there is no CA: trust is
//! anchored in the certificate's own key.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::Keypair;

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for mesh connections.
pub const ALPN: &[u8] = b"tapestry";

/// Server name presented by clients; certificates are issued for it.
pub const SERVER_NAME: &str = "tapestry";

/// Idle connections are closed after this long without traffic.
const MAX_IDLE_TIMEOUT_MS: u32 = 60_000;

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    // PKCS#8 v1 wrapper around the raw 32-byte seed.
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

    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;

    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.node_id().to_hex()),
    );
    params.distinguished_name.push(
        rcgen::DnType::OrganizationalUnitName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let client_cert_verifier = Arc::new(Ed25519ClientCertVerifier);
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(quinn::VarInt::from_u32(MAX_IDLE_TIMEOUT_MS).into()));
    transport.max_concurrent_bidi_streams(64u32.into());
    transport.max_concurrent_uni_streams(0u32.into());
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519ServerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(quinn::VarInt::from_u32(MAX_IDLE_TIMEOUT_MS).into()));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

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

/// Public key of the peer on an established connection.
pub fn extract_peer_public_key(connection: &quinn::Connection) -> Option<[u8; 32]> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    extract_public_key_from_cert(cert_der)
}

fn verify_ed25519_cert(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
        rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
    )?;

    if VerifyingKey::from_bytes(&public_key).is_err() {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::ApplicationVerificationFailure,
        ));
    }
    Ok(())
}

fn verify_tls12(
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

fn verify_tls13(
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

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        verify_ed25519_cert(end_entity)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519ServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        verify_ed25519_cert(end_entity)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn certificate_carries_the_keypair_public_key() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_ed25519_cert(&keypair).expect("cert generation must succeed");

            let extracted = extract_public_key_from_cert(certs[0].as_ref())
                .expect("public key extraction must succeed");
            assert_eq!(extracted, keypair.public_key_bytes());
        }
    }

    #[test]
    fn generated_certificates_pass_verification() {
        let keypair = Keypair::generate();
        let (certs, _) = generate_ed25519_cert(&keypair).unwrap();
        assert!(verify_ed25519_cert(&certs[0]).is_ok());
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let bogus = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        assert!(verify_ed25519_cert(&bogus).is_err());
    }

    #[test]
    fn different_keypairs_yield_different_certificate_keys() {
        let mut public_keys = HashSet::new();
        for _ in 0..50 {
            let keypair = Keypair::generate();
            let (certs, _) = generate_ed25519_cert(&keypair).unwrap();
            let cert_pk = extract_public_key_from_cert(certs[0].as_ref()).unwrap();
            assert!(public_keys.insert(cert_pk));
        }
    }

    #[test]
    fn configs_build_from_generated_certificate() {
        let keypair = Keypair::generate();
        let (certs, key) = generate_ed25519_cert(&keypair).unwrap();
        assert!(create_server_config(certs.clone(), key.clone_key()).is_ok());
        assert!(create_client_config(certs, key).is_ok());
    }
}
