//! CA root records and the set of roots trusted across a rotation.
//!
//! Exactly one root is active at a time. A rotated-out root stays in the set
//! until every leaf it could have signed has expired, so in-flight
//! certificates keep verifying.

use crate::certificate::{colon_hex, Certificate, TrustBundle};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// A trusted CA root.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaRoot {
    /// SHA-256 fingerprint of the root certificate.
    pub id: String,
    pub name: String,
    /// Colon-separated hex; X.509 serials may be up to 20 bytes.
    pub serial_number: String,
    /// Subject key identifier of the key that signs leaves.
    pub signing_key_id: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub root_cert: String,
    /// Certificates chaining leaves to this root, such as a cross-signed
    /// certificate issued by the previous root.
    pub intermediate_certs: Vec<String>,
    /// Certificate currently signing leaves when it differs from the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_cert: Option<String>,
    #[serde(default, skip_serializing)]
    pub signing_key: Option<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_out_at: Option<DateTime<Utc>>,
}

impl CaRoot {
    /// Builds a root record from a PEM root certificate.
    pub fn from_pem(name: impl Into<String>, root_pem: &str) -> Result<Self> {
        let cert = Certificate::from_pem(root_pem)?;
        if !cert.is_ca()? {
            return Err(Error::Validation(
                "root certificate is not a CA".to_string(),
            ));
        }
        let signing_key_id = match cert.subject_key_id()? {
            Some(ski) => colon_hex(&ski),
            None => colon_hex(&Sha256::digest(cert.public_key_der()?)),
        };
        Ok(Self {
            id: cert.fingerprint(),
            name: name.into(),
            serial_number: cert.serial_hex()?,
            signing_key_id,
            not_before: cert.not_before()?,
            not_after: cert.not_after()?,
            root_cert: cert.to_pem().to_string(),
            intermediate_certs: Vec::new(),
            signing_cert: None,
            signing_key: None,
            active: false,
            rotated_out_at: None,
        })
    }
}

impl std::fmt::Debug for CaRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaRoot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("serial_number", &self.serial_number)
            .field("signing_key_id", &self.signing_key_id)
            .field("not_after", &self.not_after)
            .field("intermediate_certs", &self.intermediate_certs.len())
            .field("signing_key", &self.signing_key.as_ref().map(|_| "[REDACTED]"))
            .field("active", &self.active)
            .field("rotated_out_at", &self.rotated_out_at)
            .finish()
    }
}

/// All roots trusted within one trust domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexedCaRoots {
    pub active_root_id: Option<String>,
    pub trust_domain: String,
    pub roots: Vec<CaRoot>,
}

impl IndexedCaRoots {
    pub fn new(trust_domain: impl Into<String>) -> Self {
        Self {
            active_root_id: None,
            trust_domain: trust_domain.into(),
            roots: Vec::new(),
        }
    }

    /// Returns the active root.
    pub fn active(&self) -> Option<&CaRoot> {
        self.roots.iter().find(|r| r.active)
    }

    /// Makes `root` the active root.
    ///
    /// The previous active root is marked rotated out at `now`. When
    /// `cross_signed` is given (the new root re-issued by the previous one)
    /// it is recorded as an intermediate of the new root.
    pub fn rotate_to(
        &mut self,
        mut root: CaRoot,
        cross_signed: Option<String>,
        now: DateTime<Utc>,
    ) {
        for existing in &mut self.roots {
            if existing.active {
                existing.active = false;
                existing.rotated_out_at = Some(now);
            }
        }
        if let Some(cert) = cross_signed {
            root.intermediate_certs.push(cert);
        }
        root.active = true;
        root.rotated_out_at = None;
        self.active_root_id = Some(root.id.clone());
        self.roots.retain(|r| r.id != root.id);
        self.roots.push(root);
    }

    /// Drops inactive roots whose leaves can no longer be valid.
    ///
    /// A root is kept for twice the leaf TTL after it was rotated out, and
    /// never past its own expiry. Returns the number of roots removed.
    pub fn prune(&mut self, now: DateTime<Utc>, leaf_ttl: Duration) -> usize {
        let grace = chrono::Duration::from_std(leaf_ttl * 2).unwrap_or(chrono::Duration::MAX);
        let before = self.roots.len();
        self.roots.retain(|r| {
            if r.active {
                return true;
            }
            if r.not_after <= now {
                return false;
            }
            match r.rotated_out_at {
                Some(at) => at.checked_add_signed(grace).map_or(true, |until| now < until),
                None => true,
            }
        });
        before - self.roots.len()
    }

    /// Returns every root certificate as a trust bundle.
    pub fn trust_bundle(&self) -> Result<TrustBundle> {
        let roots = self
            .roots
            .iter()
            .map(|r| Certificate::from_pem(&r.root_cert))
            .collect::<Result<Vec<_>>>()?;
        Ok(TrustBundle::new(roots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    fn ca_pem() -> String {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn test_from_pem() {
        let root = CaRoot::from_pem("root-1", &ca_pem()).unwrap();
        assert_eq!(root.id.split(':').count(), 32);
        assert!(!root.signing_key_id.is_empty());
        assert!(!root.active);
    }

    #[test]
    fn test_from_pem_keeps_long_serial() {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.serial_number = Some(rcgen::SerialNumber::from_slice(&[0x5a; 20]));
        let root = CaRoot::from_pem("external", &params.self_signed(&key).unwrap().pem()).unwrap();
        assert_eq!(root.serial_number, vec!["5a"; 20].join(":"));
    }

    #[test]
    fn test_from_pem_rejects_leaf() {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let leaf = CertificateParams::new(vec!["web".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap()
            .pem();
        assert!(matches!(
            CaRoot::from_pem("leaf", &leaf),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rotate_marks_previous_inactive() {
        let now = Utc::now();
        let mut roots = IndexedCaRoots::new("abc.mesh");
        let first = CaRoot::from_pem("r1", &ca_pem()).unwrap();
        let second = CaRoot::from_pem("r2", &ca_pem()).unwrap();
        let second_id = second.id.clone();

        roots.rotate_to(first, None, now);
        roots.rotate_to(second, Some("cross".to_string()), now);

        let active = roots.active().unwrap();
        assert_eq!(active.id, second_id);
        assert_eq!(active.intermediate_certs, vec!["cross".to_string()]);
        assert_eq!(roots.active_root_id.as_deref(), Some(second_id.as_str()));
        assert_eq!(roots.roots.iter().filter(|r| r.active).count(), 1);
        assert_eq!(roots.roots[0].rotated_out_at, Some(now));
        assert_eq!(roots.trust_bundle().unwrap().roots().len(), 2);
    }

    #[test]
    fn test_prune_after_leaf_lifetime() {
        let now = Utc::now();
        let leaf_ttl = Duration::from_secs(3600);
        let mut roots = IndexedCaRoots::new("abc.mesh");
        roots.rotate_to(CaRoot::from_pem("r1", &ca_pem()).unwrap(), None, now);
        roots.rotate_to(CaRoot::from_pem("r2", &ca_pem()).unwrap(), None, now);

        assert_eq!(roots.prune(now + chrono::Duration::minutes(90), leaf_ttl), 0);
        assert_eq!(roots.prune(now + chrono::Duration::hours(3), leaf_ttl), 1);
        assert_eq!(roots.roots.len(), 1);
        assert!(roots.roots[0].active);
    }

    #[test]
    fn test_signing_key_not_serialized() {
        let mut root = CaRoot::from_pem("r1", &ca_pem()).unwrap();
        root.signing_key = Some("secret".to_string());
        let json = serde_json::to_string(&root).unwrap();
        assert!(!json.contains("secret"));
        assert!(!format!("{root:?}").contains("secret"));
    }
}
