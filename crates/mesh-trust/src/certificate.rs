//! X.509 certificate handling.
//!
//! Types for certificates, private keys and trust bundles exchanged as PEM,
//! plus accessors for the fields the CA and verifiers care about: the single
//! SPIFFE URI SAN, serial number, key identifiers and validity.

use crate::spiffe::SpiffeId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// An X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// DER-encoded certificate data.
    der: Vec<u8>,
    /// PEM representation (cached).
    pem: String,
}

impl Certificate {
    /// Creates a certificate from DER-encoded bytes.
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = encode_pem(CERTIFICATE_TAG, &der);
        Self { der, pem }
    }

    /// Creates a certificate from a single PEM block.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let parsed = pem::parse(pem_str)
            .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
        if parsed.tag() != CERTIFICATE_TAG {
            return Err(Error::Certificate(format!(
                "expected {CERTIFICATE_TAG} PEM block, got {}",
                parsed.tag()
            )));
        }
        let cert = Self::from_der(parsed.into_contents());
        cert.with_parsed(|_| Ok(()))?;
        Ok(cert)
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    /// Returns the certificate as a rustls DER value.
    pub fn to_rustls(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.der.clone())
    }

    fn with_parsed<T>(&self, f: impl FnOnce(&X509Certificate<'_>) -> Result<T>) -> Result<T> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        f(&cert)
    }

    /// Returns every URI in the Subject Alternative Name extension.
    pub fn uris(&self) -> Result<Vec<String>> {
        self.with_parsed(|cert| Ok(uri_sans(cert)))
    }

    /// Returns the SPIFFE identity of this certificate.
    ///
    /// The SAN extension must hold exactly one URI.
    pub fn spiffe_id(&self) -> Result<SpiffeId> {
        let uris = self.uris()?;
        match uris.as_slice() {
            [uri] => SpiffeId::parse(uri),
            _ => Err(Error::Validation(format!(
                "certificate must have exactly one URI SAN, found {}",
                uris.len()
            ))),
        }
    }

    /// Returns the serial number as an integer.
    ///
    /// Only serials of at most 8 bytes fit, as issued from a provider's
    /// counter. Use [`serial_hex`](Self::serial_hex) for arbitrary certificates.
    pub fn serial_number(&self) -> Result<u64> {
        self.with_parsed(|cert| serial_to_u64(cert.raw_serial()))
    }

    /// Returns the serial number as colon-separated hex, leading zeros removed.
    pub fn serial_hex(&self) -> Result<String> {
        self.with_parsed(|cert| Ok(colon_hex(trim_serial(cert.raw_serial()))))
    }

    /// Returns the certificate's not-before time.
    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        self.with_parsed(|cert| {
            DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
                .ok_or_else(|| Error::Certificate("invalid not_before timestamp".to_string()))
        })
    }

    /// Returns the certificate's not-after (expiry) time.
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        self.with_parsed(|cert| {
            DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
                .ok_or_else(|| Error::Certificate("invalid not_after timestamp".to_string()))
        })
    }

    /// Returns the certificate's subject as a string.
    pub fn subject(&self) -> Result<String> {
        self.with_parsed(|cert| Ok(cert.subject().to_string()))
    }

    /// Returns the subject as an rcgen name, keeping each attribute's string
    /// type so a re-issued certificate carries an identical subject.
    pub(crate) fn subject_dn(&self) -> Result<rcgen::DistinguishedName> {
        use rcgen::string::{Ia5String, PrintableString};
        use rcgen::{DnType, DnValue};
        use x509_parser::der_parser::asn1_rs::Tag;

        self.with_parsed(|cert| {
            let mut dn = rcgen::DistinguishedName::new();
            for attr in cert.subject().iter_attributes() {
                let arcs: Vec<u64> = attr
                    .attr_type()
                    .iter()
                    .map(|arcs| arcs.collect())
                    .ok_or_else(|| Error::Certificate("subject OID too large".to_string()))?;
                let text = attr
                    .as_str()
                    .map_err(|e| Error::Certificate(format!("unsupported subject value: {e}")))?
                    .to_string();
                let tag = attr.attr_value().header.tag();
                let value = if tag == Tag::PrintableString {
                    DnValue::PrintableString(
                        PrintableString::try_from(text)
                            .map_err(|e| Error::Certificate(e.to_string()))?,
                    )
                } else if tag == Tag::Ia5String {
                    DnValue::Ia5String(
                        Ia5String::try_from(text).map_err(|e| Error::Certificate(e.to_string()))?,
                    )
                } else {
                    DnValue::Utf8String(text)
                };
                dn.push(DnType::from_oid(&arcs), value);
            }
            Ok(dn)
        })
    }

    /// Returns the certificate's issuer as a string.
    pub fn issuer(&self) -> Result<String> {
        self.with_parsed(|cert| Ok(cert.issuer().to_string()))
    }

    /// Checks if this certificate is a CA certificate.
    pub fn is_ca(&self) -> Result<bool> {
        self.with_parsed(|cert| Ok(cert.is_ca()))
    }

    /// Returns the path length constraint of a CA certificate, if any.
    pub fn max_path_len(&self) -> Result<Option<u32>> {
        self.with_parsed(|cert| {
            Ok(cert
                .basic_constraints()
                .ok()
                .flatten()
                .and_then(|bc| bc.value.path_len_constraint))
        })
    }

    /// Returns the subject key identifier, if present.
    pub fn subject_key_id(&self) -> Result<Option<Vec<u8>>> {
        self.with_parsed(|cert| {
            for ext in cert.extensions() {
                if let ParsedExtension::SubjectKeyIdentifier(ski) = ext.parsed_extension() {
                    return Ok(Some(ski.0.to_vec()));
                }
            }
            Ok(None)
        })
    }

    /// Returns the authority key identifier, if present.
    pub fn authority_key_id(&self) -> Result<Option<Vec<u8>>> {
        self.with_parsed(|cert| {
            for ext in cert.extensions() {
                if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
                    return Ok(aki.key_identifier.as_ref().map(|k| k.0.to_vec()));
                }
            }
            Ok(None)
        })
    }

    /// Returns the DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        self.with_parsed(|cert| Ok(cert.public_key().raw.to_vec()))
    }

    /// Returns true if `key` is the private half of this certificate's key.
    pub fn matches_key(&self, key: &PrivateKey) -> Result<bool> {
        Ok(self.public_key_der()? == key.public_key_der()?)
    }

    /// Returns the SHA-256 fingerprint as colon-separated hex.
    pub fn fingerprint(&self) -> String {
        colon_hex(&Sha256::digest(&self.der))
    }
}

/// Parses every `CERTIFICATE` block in a PEM string, in order.
///
/// Other block types are skipped.
pub fn parse_cert_chain_pem(pem_str: &str) -> Result<Vec<Certificate>> {
    let blocks = pem::parse_many(pem_str)
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
    let certs = blocks
        .into_iter()
        .filter(|p| p.tag() == CERTIFICATE_TAG)
        .map(|p| Certificate::from_der(p.into_contents()))
        .collect();
    Ok(certs)
}

/// A private key.
#[derive(Clone)]
pub struct PrivateKey {
    /// PEM-encoded private key.
    pem: String,
}

impl PrivateKey {
    /// Creates a private key from PEM-encoded data.
    ///
    /// Accepts PKCS#8, SEC1 (`EC PRIVATE KEY`) and PKCS#1 (`RSA PRIVATE KEY`)
    /// blocks.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let parsed = pem::parse(pem_str)
            .map_err(|e| Error::Certificate(format!("failed to parse private key PEM: {e}")))?;
        if !parsed.tag().ends_with("PRIVATE KEY") {
            return Err(Error::Certificate("not a private key PEM".to_string()));
        }
        Ok(Self {
            pem: pem_str.to_string(),
        })
    }

    /// Returns the PEM-encoded private key.
    pub fn as_pem(&self) -> &str {
        &self.pem
    }

    /// Loads the key as an rcgen key pair for signing.
    pub fn key_pair(&self) -> Result<rcgen::KeyPair> {
        rcgen::KeyPair::from_pem(&self.pem)
            .map_err(|e| Error::Certificate(format!("failed to load private key: {e}")))
    }

    /// Returns the DER-encoded SubjectPublicKeyInfo of the matching public key.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(rcgen::PublicKeyData::subject_public_key_info(&self.key_pair()?))
    }

    /// Converts to a rustls private key, keeping the original encoding.
    pub fn to_rustls(&self) -> Result<PrivateKeyDer<'static>> {
        let parsed = pem::parse(&self.pem)
            .map_err(|e| Error::Certificate(format!("failed to parse private key PEM: {e}")))?;
        let tag = parsed.tag().to_string();
        let der = parsed.into_contents();
        match tag.as_str() {
            "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(der.into())),
            "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(der.into())),
            "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(der.into())),
            other => Err(Error::Certificate(format!(
                "unsupported private key block: {other}"
            ))),
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pem", &"[REDACTED]")
            .finish()
    }
}

/// A trust bundle containing root CA certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustBundle {
    /// Root CA certificates.
    roots: Vec<Certificate>,
}

impl TrustBundle {
    /// Creates a new trust bundle from root certificates.
    pub fn new(roots: Vec<Certificate>) -> Self {
        Self { roots }
    }

    /// Creates a trust bundle from concatenated PEM certificates.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let roots = parse_cert_chain_pem(pem_str)?;
        Ok(Self { roots })
    }

    /// Returns the root certificates.
    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Returns the bundle as concatenated PEM.
    pub fn to_pem(&self) -> String {
        self.roots.iter().map(|c| c.to_pem()).collect()
    }

    /// Converts to a rustls RootCertStore.
    pub fn to_rustls_root_store(&self) -> Result<Arc<rustls::RootCertStore>> {
        let mut store = rustls::RootCertStore::empty();
        for cert in &self.roots {
            store
                .add(cert.to_rustls())
                .map_err(|e| Error::Certificate(format!("failed to add root cert: {e}")))?;
        }
        Ok(Arc::new(store))
    }
}

fn uri_sans(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut uris = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::URI(uri) = name {
                    uris.push(uri.to_string());
                }
            }
        }
    }
    uris
}

fn trim_serial(raw: &[u8]) -> &[u8] {
    match raw.iter().position(|b| *b != 0) {
        Some(idx) => &raw[idx..],
        None => &raw[raw.len().saturating_sub(1)..],
    }
}

/// Folds a big-endian DER integer into a u64.
pub(crate) fn serial_to_u64(raw: &[u8]) -> Result<u64> {
    let trimmed = trim_serial(raw);
    if trimmed.len() > 8 {
        return Err(Error::Certificate(format!(
            "serial number too large ({} bytes)",
            trimmed.len()
        )));
    }
    Ok(trimmed.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Minimal big-endian encoding of a serial number.
pub(crate) fn serial_from_u64(serial: u64) -> rcgen::SerialNumber {
    let bytes = serial.to_be_bytes();
    let start = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len() - 1);
    rcgen::SerialNumber::from_slice(&bytes[start..])
}

/// Encodes DER as PEM with LF line endings.
pub(crate) fn encode_pem(tag: &str, der: &[u8]) -> String {
    pem::encode_config(
        &pem::Pem::new(tag, der.to_vec()),
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

pub(crate) fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::CsrOptions;
    use rcgen::{CertificateParams, KeyPair, SanType};

    fn self_signed(uris: &[&str]) -> (Certificate, PrivateKey) {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.serial_number = Some(serial_from_u64(42));
        params.subject_alt_names = uris
            .iter()
            .map(|u| SanType::URI(rcgen::string::Ia5String::try_from(u.to_string()).unwrap()))
            .collect();
        let cert = params.self_signed(&key).unwrap();
        (
            Certificate::from_pem(&cert.pem()).unwrap(),
            PrivateKey::from_pem(&key.serialize_pem()).unwrap(),
        )
    }

    #[test]
    fn test_spiffe_id_single_uri() {
        let uri = "spiffe://abc.mesh/ns/default/dc/dc1/svc/web";
        let (cert, _) = self_signed(&[uri]);
        assert_eq!(cert.spiffe_id().unwrap().uri(), uri);
    }

    #[test]
    fn test_spiffe_id_requires_exactly_one_uri() {
        let (none, _) = self_signed(&[]);
        assert!(matches!(none.spiffe_id(), Err(Error::Validation(_))));

        let (two, _) = self_signed(&[
            "spiffe://abc.mesh/ns/default/dc/dc1/svc/web",
            "spiffe://abc.mesh/ns/default/dc/dc1/svc/db",
        ]);
        assert!(matches!(two.spiffe_id(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_serial_number() {
        let (cert, _) = self_signed(&[]);
        assert_eq!(cert.serial_number().unwrap(), 42);
    }

    #[test]
    fn test_serial_hex_accepts_long_serials() {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.serial_number = Some(rcgen::SerialNumber::from_slice(&[0x7f; 20]));
        let cert = Certificate::from_pem(&params.self_signed(&key).unwrap().pem()).unwrap();

        assert_eq!(cert.serial_hex().unwrap(), vec!["7f"; 20].join(":"));
        assert!(cert.serial_number().is_err());

        let (small, _) = self_signed(&[]);
        assert_eq!(small.serial_hex().unwrap(), "2a");
    }

    #[test]
    fn test_subject_dn_round_trips() {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "pri-1.mesh.ca.abc.mesh");
        params.distinguished_name.push(
            rcgen::DnType::CountryName,
            rcgen::DnValue::PrintableString(rcgen::string::PrintableString::try_from("US").unwrap()),
        );
        let original = Certificate::from_pem(&params.self_signed(&key).unwrap().pem()).unwrap();

        let mut reissued = CertificateParams::new(vec![]).unwrap();
        reissued.distinguished_name = original.subject_dn().unwrap();
        let copy = Certificate::from_pem(&reissued.self_signed(&key).unwrap().pem()).unwrap();

        let (_, a) = x509_parser::parse_x509_certificate(original.der()).unwrap();
        let (_, b) = x509_parser::parse_x509_certificate(copy.der()).unwrap();
        assert_eq!(a.subject().as_raw(), b.subject().as_raw());
    }

    #[test]
    fn test_serial_encoding() {
        assert_eq!(serial_to_u64(&[0x00, 0x80]).unwrap(), 128);
        assert_eq!(serial_to_u64(&[0x01]).unwrap(), 1);
        assert_eq!(serial_to_u64(&[]).unwrap(), 0);
        assert!(serial_to_u64(&[1, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert_eq!(serial_from_u64(1).to_bytes(), vec![1]);
        assert_eq!(serial_from_u64(0).to_bytes(), vec![0]);
        assert_eq!(serial_from_u64(0x0102).to_bytes(), vec![1, 2]);
    }

    #[test]
    fn test_matches_key() {
        let (cert, key) = self_signed(&[]);
        let (_, other) = self_signed(&[]);
        assert!(cert.matches_key(&key).unwrap());
        assert!(!cert.matches_key(&other).unwrap());
    }

    #[test]
    fn test_parse_chain_skips_other_blocks() {
        let (a, key) = self_signed(&[]);
        let (b, _) = self_signed(&[]);
        let bundle = format!("{}{}{}", a.to_pem(), key.as_pem(), b.to_pem());
        let chain = parse_cert_chain_pem(&bundle).unwrap();
        assert_eq!(chain, vec![a, b]);
    }

    #[test]
    fn test_from_pem_rejects_csr() {
        let csr = CsrOptions::new("spiffe://abc.mesh/ns/default/dc/dc1/svc/web")
            .generate()
            .unwrap();
        assert!(Certificate::from_pem(csr.csr()).is_err());
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let (_, key) = self_signed(&[]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("BEGIN"));
    }

    #[test]
    fn test_private_key_rejects_certificate() {
        let (cert, _) = self_signed(&[]);
        assert!(PrivateKey::from_pem(cert.to_pem()).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let (cert, _) = self_signed(&[]);
        let fp = cert.fingerprint();
        assert_eq!(fp.split(':').count(), 32);
    }

    #[test]
    fn test_trust_bundle_roundtrip() {
        let (a, _) = self_signed(&[]);
        let (b, _) = self_signed(&[]);
        let bundle = TrustBundle::new(vec![a, b]);
        let reparsed = TrustBundle::from_pem(&bundle.to_pem()).unwrap();
        assert_eq!(reparsed.roots().len(), 2);
        assert_eq!(bundle.to_rustls_root_store().unwrap().len(), 2);
    }
}
