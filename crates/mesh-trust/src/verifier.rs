//! Chain verification and SPIFFE-aware rustls verifiers.
//!
//! - [`TrustDomainVerifier`] checks inbound client certificates chain to the
//!   trust bundle and carry an identity in the local trust domain.
//! - [`SpiffeServerVerifier`] does the same for outbound connections and can
//!   additionally pin the expected peer identities.
//!
//! Mesh certificates identify workloads by URI SAN, so neither verifier
//! checks DNS names.

use crate::certificate::{Certificate, TrustBundle};
use crate::spiffe::SpiffeId;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, TrustAnchor, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::sync::Arc;
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};

/// Verifies `leaf` chains through `intermediates` to a root in `bundle`.
///
/// Validity periods, signatures and the server-auth extended key usage are
/// checked at the current time.
pub fn verify_leaf_chain(
    leaf: &Certificate,
    intermediates: &[Certificate],
    bundle: &TrustBundle,
) -> Result<()> {
    let anchors = trust_anchors(bundle)?;
    let leaf_der = leaf.to_rustls();
    let intermediates: Vec<CertificateDer<'static>> =
        intermediates.iter().map(Certificate::to_rustls).collect();
    verify_chain(
        &leaf_der,
        &intermediates,
        &anchors,
        UnixTime::now(),
        KeyUsage::server_auth(),
    )
    .map_err(|e| Error::Validation(format!("certificate chain verification failed: {e}")))
}

/// Checks that `child` was signed by `issuer` and both are currently valid.
pub fn verify_issued_by(child: &Certificate, issuer: &Certificate) -> Result<()> {
    let (_, child_x509) = x509_parser::parse_x509_certificate(child.der())
        .map_err(|e| Error::Validation(format!("failed to parse certificate: {e}")))?;
    let (_, issuer_x509) = x509_parser::parse_x509_certificate(issuer.der())
        .map_err(|e| Error::Validation(format!("failed to parse issuer: {e}")))?;

    if child_x509.issuer().as_raw() != issuer_x509.subject().as_raw() {
        return Err(Error::Validation(format!(
            "certificate issuer {} does not match {}",
            child_x509.issuer(),
            issuer_x509.subject()
        )));
    }
    if !issuer_x509.is_ca() {
        return Err(Error::Validation("issuer is not a CA".to_string()));
    }
    child_x509
        .verify_signature(Some(issuer_x509.public_key()))
        .map_err(|e| Error::Validation(format!("signature verification failed: {e}")))?;
    if !child_x509.validity().is_valid() || !issuer_x509.validity().is_valid() {
        return Err(Error::Validation(
            "certificate is expired or not yet valid".to_string(),
        ));
    }
    Ok(())
}

/// Extracts the SPIFFE identity from a DER-encoded certificate.
pub fn peer_identity(cert_der: &[u8]) -> Result<SpiffeId> {
    Certificate::from_der(cert_der.to_vec()).spiffe_id()
}

fn trust_anchors(bundle: &TrustBundle) -> Result<Vec<TrustAnchor<'static>>> {
    bundle
        .roots()
        .iter()
        .map(|cert| {
            let der = cert.to_rustls();
            anchor_from_trusted_cert(&der)
                .map(|anchor| anchor.to_owned())
                .map_err(|e| Error::Certificate(format!("failed to parse trust anchor: {e:?}")))
        })
        .collect()
}

fn verify_chain(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    anchors: &[TrustAnchor<'_>],
    now: UnixTime,
    usage: KeyUsage,
) -> std::result::Result<(), rustls::Error> {
    let cert = EndEntityCert::try_from(end_entity).map_err(|e| {
        tracing::warn!("failed to parse end-entity certificate: {e:?}");
        rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
    })?;
    cert.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        anchors,
        intermediates,
        now,
        usage,
        None,
        None,
    )
    .map_err(|e| {
        tracing::debug!("webpki chain verification failed: {e:?}");
        rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature)
    })?;
    Ok(())
}

fn check_trust_domain(id: &SpiffeId, trust_domain: &str) -> Result<()> {
    let host = id.host();
    if host.eq_ignore_ascii_case(trust_domain) {
        Ok(())
    } else {
        Err(Error::TrustDomainMismatch {
            expected: trust_domain.to_string(),
            actual: host,
        })
    }
}

/// Verifies that client certificates carry an identity in the trust domain.
#[derive(Debug)]
pub struct TrustDomainVerifier {
    trust_domain: String,
    inner: Arc<dyn ClientCertVerifier>,
}

impl TrustDomainVerifier {
    pub fn new(trust_domain: impl Into<String>, trust_bundle: &TrustBundle) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let inner =
            WebPkiClientVerifier::builder_with_provider(trust_bundle.to_rustls_root_store()?, provider)
                .build()
                .map_err(|e| Error::Certificate(format!("failed to build client verifier: {e}")))?;
        Ok(Self {
            trust_domain: trust_domain.into(),
            inner,
        })
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    fn verify_identity(&self, cert_der: &[u8]) -> Result<SpiffeId> {
        let id = peer_identity(cert_der)?;
        check_trust_domain(&id, &self.trust_domain)?;
        Ok(id)
    }
}

impl ClientCertVerifier for TrustDomainVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.inner
            .verify_client_cert(end_entity, intermediates, now)?;
        self.verify_identity(end_entity.as_ref()).map_err(|e| {
            rustls::Error::General(format!("SPIFFE identity verification failed: {e}"))
        })?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

/// Verifies server certificates by SPIFFE identity rather than DNS name.
pub struct SpiffeServerVerifier {
    trust_domain: String,
    /// Empty accepts any identity in the trust domain.
    expected: Vec<SpiffeId>,
    trust_anchors: Vec<TrustAnchor<'static>>,
    crypto_provider: Arc<CryptoProvider>,
}

impl SpiffeServerVerifier {
    pub fn new(trust_domain: impl Into<String>, trust_bundle: &TrustBundle) -> Result<Self> {
        Ok(Self {
            trust_domain: trust_domain.into(),
            expected: Vec::new(),
            trust_anchors: trust_anchors(trust_bundle)?,
            crypto_provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Only accepts servers presenting one of `expected`.
    pub fn with_expected(mut self, expected: Vec<SpiffeId>) -> Self {
        self.expected = expected;
        self
    }

    fn verify_identity(&self, cert_der: &[u8]) -> Result<SpiffeId> {
        let id = peer_identity(cert_der)?;
        check_trust_domain(&id, &self.trust_domain)?;
        if !self.expected.is_empty() && !self.expected.contains(&id) {
            return Err(Error::Validation(format!(
                "server identity {id} is not expected"
            )));
        }
        Ok(id)
    }
}

impl std::fmt::Debug for SpiffeServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiffeServerVerifier")
            .field("trust_domain", &self.trust_domain)
            .field("expected", &self.expected)
            .field("trust_anchors_count", &self.trust_anchors.len())
            .finish()
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        verify_chain(
            end_entity,
            intermediates,
            &self.trust_anchors,
            now,
            KeyUsage::server_auth(),
        )?;
        self.verify_identity(end_entity.as_ref()).map_err(|e| {
            rustls::Error::General(format!("SPIFFE identity verification failed: {e}"))
        })?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto_provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto_provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
