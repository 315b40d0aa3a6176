//! TLS client configuration for pull sources
//!
//! When a path configures a `source_fingerprint`, certificate validation
//! pins to that SHA-256 fingerprint and skips the system roots entirely,
//! which is how self-signed camera certificates are trusted. Without a
//! fingerprint the standard web-PKI roots apply.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use sha2::{Digest, Sha256};

/// Build a client configuration honoring an optional pinned fingerprint
pub fn config_for_fingerprint(fingerprint: &str) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    if fingerprint.is_empty() {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(Arc::new(
            ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|e| TlsConfigError::Provider(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth(),
        ));
    }

    let digest = hex::decode(fingerprint)
        .map_err(|e| TlsConfigError::InvalidFingerprint(e.to_string()))?;
    if digest.len() != 32 {
        return Err(TlsConfigError::InvalidFingerprint(
            "fingerprint must be a SHA-256 digest".to_string(),
        ));
    }

    let verifier = FingerprintVerifier {
        digest,
        provider: rustls::crypto::ring::default_provider(),
    };
    Ok(Arc::new(
        ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsConfigError::Provider(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth(),
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("invalid certificate fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("TLS provider error: {0}")]
    Provider(String),
}

/// Verifier that accepts exactly one certificate, identified by digest
#[derive(Debug)]
struct FingerprintVerifier {
    digest: Vec<u8>,
    provider: CryptoProvider,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.digest.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
