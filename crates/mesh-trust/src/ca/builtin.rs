//! The built-in certificate authority.
//!
//! Keys and certificates live in [`ProviderState`] records written through a
//! [`StateDelegate`]. Each signing operation re-reads that state, so every
//! server in the cluster observes the same root, intermediate and serial
//! counter.

use super::{Provider, ProviderPhase};
use crate::certificate::{serial_from_u64, Certificate, PrivateKey};
use crate::config::{BuiltinProviderConfig, ProviderConfig};
use crate::csr::{can_generate, generate_key_pair, verified_csr_uris, CsrOptions};
use crate::limit::CsrLimiter;
use crate::spiffe::{SpiffeId, SpiffeIdSigning};
use crate::state::{ProviderState, StateDelegate};
use crate::verifier::verify_issued_by;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose,
    SanType, SubjectPublicKeyInfo,
};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Backdating applied to issued certificates to absorb clock skew.
const CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Validity of a cross-signed root.
const CROSS_SIGN_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

struct Settings {
    id: String,
    cluster_id: String,
    is_primary: bool,
    signing_id: SpiffeIdSigning,
    config: BuiltinProviderConfig,
    limiter: CsrLimiter,
}

/// A [`Provider`] that signs with keys held in replicated state.
///
/// # Example
///
/// ```no_run
/// use mesh_trust::{BuiltinProvider, CsrOptions, InMemoryStateDelegate, Provider, ProviderConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> mesh_trust::Result<()> {
/// let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
/// provider.configure(&ProviderConfig::new("6c3a5f5e-9c4b-4a25-8b1e-5d0c2f3e4a11", true)).await?;
/// provider.generate_root().await?;
///
/// let csr = CsrOptions::new("spiffe://6c3a5f5e-9c4b-4a25-8b1e-5d0c2f3e4a11.mesh/ns/default/dc/dc1/svc/web")
///     .generate()?;
/// let leaf = provider.sign(csr.csr()).await?;
/// # Ok(())
/// # }
/// ```
pub struct BuiltinProvider<D: StateDelegate> {
    delegate: Arc<D>,
    settings: RwLock<Option<Arc<Settings>>>,
    phase: Mutex<ProviderPhase>,
    /// Serializes serial allocation.
    sign_lock: tokio::sync::Mutex<()>,
}

impl<D: StateDelegate> BuiltinProvider<D> {
    pub fn new(delegate: Arc<D>) -> Self {
        Self {
            delegate,
            settings: RwLock::new(None),
            phase: Mutex::new(ProviderPhase::Unconfigured),
            sign_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the current lifecycle phase.
    pub fn phase(&self) -> ProviderPhase {
        *self.phase.lock()
    }

    /// Returns the ID of this provider's state record, once configured.
    pub fn state_id(&self) -> Option<String> {
        self.settings.read().as_ref().map(|s| s.id.clone())
    }

    /// Returns the signing identity of this provider's trust domain.
    pub fn signing_id(&self) -> Option<SpiffeIdSigning> {
        self.settings.read().as_ref().map(|s| s.signing_id.clone())
    }

    /// Returns the applied configuration.
    pub fn config(&self) -> Option<BuiltinProviderConfig> {
        self.settings.read().as_ref().map(|s| s.config.clone())
    }

    fn settings(&self) -> Result<Arc<Settings>> {
        self.settings
            .read()
            .clone()
            .ok_or_else(|| Error::NotInitialized("provider is not configured".to_string()))
    }

    fn set_phase(&self, phase: ProviderPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            let from = *current;
            debug!(%from, to = %phase, "CA provider phase change");
            *current = phase;
        }
    }

    async fn read_state(&self, settings: &Settings) -> Result<ProviderState> {
        match self.delegate.read_provider_state(&settings.id).await? {
            Some((_, state)) => Ok(state),
            None => Err(Error::NotInitialized(format!(
                "no state for provider {}",
                settings.id
            ))),
        }
    }

    /// Moves state stored under an ID derived by an older scheme to `id`.
    async fn migrate_legacy_state(&self, id: &str, legacy_ids: &[String]) -> Result<bool> {
        for legacy_id in legacy_ids {
            let Some((_, mut state)) = self.delegate.read_provider_state(legacy_id).await? else {
                continue;
            };
            state.id = id.to_string();
            self.delegate.apply_provider_state_write(state).await?;
            self.delegate.apply_provider_state_delete(legacy_id).await?;
            info!(from = %legacy_id, to = %id, "migrated CA provider state");
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl<D: StateDelegate + 'static> Provider for BuiltinProvider<D> {
    async fn configure(&self, config: &ProviderConfig) -> Result<()> {
        if config.cluster_id.is_empty() {
            return Err(Error::Config("cluster_id is required".to_string()));
        }
        let parsed = BuiltinProviderConfig::from_raw(&config.raw_config)?;
        check_key_material(&parsed)?;

        let id = provider_state_id(&parsed, config.is_primary);
        let settings = Arc::new(Settings {
            id: id.clone(),
            cluster_id: config.cluster_id.clone(),
            is_primary: config.is_primary,
            signing_id: SpiffeIdSigning::new(config.cluster_id.clone()),
            limiter: CsrLimiter::from_config(&parsed),
            config: parsed,
        });

        let state = match self.delegate.read_provider_state(&id).await? {
            Some((_, state)) => state,
            None => {
                let legacy = legacy_state_ids(&settings.config, settings.is_primary);
                if !self.migrate_legacy_state(&id, &legacy).await? {
                    self.delegate
                        .apply_provider_state_write(ProviderState {
                            id: id.clone(),
                            ..Default::default()
                        })
                        .await?;
                }
                self.read_state(&settings).await?
            }
        };

        let phase = resume_phase(settings.is_primary, &state);
        *self.settings.write() = Some(settings.clone());
        self.set_phase(phase);
        info!(
            id = %settings.id,
            cluster_id = %settings.cluster_id,
            primary = settings.is_primary,
            phase = %phase,
            "configured built-in CA provider"
        );
        Ok(())
    }

    async fn generate_root(&self) -> Result<()> {
        let settings = self.settings()?;
        if !settings.is_primary {
            return Err(Error::NotPrimary(
                "only the primary datacenter generates a root".to_string(),
            ));
        }

        let state = self.read_state(&settings).await?;
        if !state.root_cert.is_empty() {
            debug!(id = %settings.id, "root already exists");
            if self.phase() == ProviderPhase::Configured {
                self.set_phase(ProviderPhase::RootReady);
            }
            return Ok(());
        }

        let private_key = match &settings.config.private_key {
            Some(key) => key.clone(),
            None => generate_key_pair(
                settings.config.private_key_type,
                settings.config.private_key_bits,
            )?
            .serialize_pem(),
        };
        let root_cert = match &settings.config.root_cert {
            Some(cert) => cert.clone(),
            None => generate_root_cert(&settings, &private_key)?,
        };

        self.delegate
            .apply_provider_state_write(ProviderState {
                private_key,
                root_cert,
                ..state
            })
            .await?;
        self.set_phase(ProviderPhase::RootReady);
        info!(id = %settings.id, trust_domain = %settings.signing_id.host(), "generated CA root");
        Ok(())
    }

    async fn active_root(&self) -> Result<String> {
        let settings = self.settings()?;
        let state = self.read_state(&settings).await?;
        if state.root_cert.is_empty() {
            return Err(Error::NotInitialized("no root certificate".to_string()));
        }
        Ok(state.root_cert)
    }

    async fn generate_intermediate_csr(&self) -> Result<String> {
        let settings = self.settings()?;
        if settings.is_primary {
            return Err(Error::IsPrimary(
                "the primary datacenter signs with its root".to_string(),
            ));
        }
        let state = self.read_state(&settings).await?;

        let key = match &settings.config.private_key {
            Some(pem) => PrivateKey::from_pem(pem)?.key_pair()?,
            None => generate_key_pair(
                settings.config.private_key_type,
                settings.config.private_key_bits,
            )?,
        };
        let csr = CsrOptions::new(settings.signing_id.uri())
            .with_common_name(ca_common_name(&settings, false)?)
            .for_ca()
            .generate_with_key(&key)?;

        self.delegate
            .apply_provider_state_write(ProviderState {
                pending_private_key: key.serialize_pem(),
                ..state
            })
            .await?;
        self.set_phase(ProviderPhase::AwaitingIntermediate);
        info!(id = %settings.id, "generated intermediate CSR");
        Ok(csr)
    }

    async fn set_intermediate(&self, intermediate_pem: &str, root_pem: &str) -> Result<()> {
        let settings = self.settings()?;
        if settings.is_primary {
            return Err(Error::IsPrimary(
                "cannot install an intermediate from another root in the primary datacenter"
                    .to_string(),
            ));
        }
        let state = self.read_state(&settings).await?;

        let intermediate = validation(Certificate::from_pem(intermediate_pem))?;
        let root = validation(Certificate::from_pem(root_pem))?;
        validate_intermediate(&intermediate, &root, &settings.signing_id)?;

        let key_pem = if state.pending_private_key.is_empty() {
            state.private_key.clone()
        } else {
            state.pending_private_key.clone()
        };
        if key_pem.is_empty() {
            return Err(Error::NotInitialized(
                "no private key; generate an intermediate CSR first".to_string(),
            ));
        }
        let key = PrivateKey::from_pem(&key_pem)?;
        if !intermediate.matches_key(&key)? {
            return Err(Error::Validation(
                "intermediate certificate does not match the provider's private key".to_string(),
            ));
        }

        self.delegate
            .apply_provider_state_write(ProviderState {
                private_key: key_pem,
                pending_private_key: String::new(),
                root_cert: root.to_pem().to_string(),
                intermediate_cert: intermediate.to_pem().to_string(),
                ..state
            })
            .await?;
        self.set_phase(ProviderPhase::IntermediateReady);
        info!(
            id = %settings.id,
            fingerprint = %intermediate.fingerprint(),
            "installed intermediate certificate"
        );
        Ok(())
    }

    async fn active_intermediate(&self) -> Result<String> {
        let settings = self.settings()?;
        let state = self.read_state(&settings).await?;
        let (cert, _) = signing_material(&settings, &state)?;
        Ok(cert.to_string())
    }

    async fn generate_intermediate(&self) -> Result<String> {
        let settings = self.settings()?;
        let intermediate = self.active_intermediate().await?;
        if settings.is_primary && self.phase() == ProviderPhase::RootReady {
            self.set_phase(ProviderPhase::IntermediateReady);
        }
        Ok(intermediate)
    }

    async fn sign(&self, csr_pem: &str) -> Result<String> {
        let settings = self.settings()?;
        let _permit = settings.limiter.admit().await?;
        let _guard = self.sign_lock.lock().await;

        let state = self.read_state(&settings).await?;
        let (signer_pem, key_pem) = signing_material(&settings, &state)?;

        let id = leaf_identity(csr_pem, &settings.signing_id)?;
        let serial = state.last_serial + 1;
        let cert = issue_leaf(&settings, signer_pem, key_pem, csr_pem, &id, serial)?;

        self.delegate
            .apply_provider_state_write(ProviderState {
                last_serial: serial,
                ..state
            })
            .await?;
        if matches!(
            self.phase(),
            ProviderPhase::RootReady | ProviderPhase::IntermediateReady
        ) {
            self.set_phase(ProviderPhase::Active);
        }
        debug!(serial, uri = %id, "signed leaf certificate");
        Ok(cert)
    }

    async fn sign_intermediate(&self, csr_pem: &str) -> Result<String> {
        let settings = self.settings()?;
        if !settings.is_primary {
            return Err(Error::NotPrimary(
                "only the primary datacenter signs intermediates".to_string(),
            ));
        }
        let _guard = self.sign_lock.lock().await;

        let state = self.read_state(&settings).await?;
        let (root_pem, key_pem) = signing_material(&settings, &state)?;

        validate_intermediate_csr(csr_pem, &settings.signing_id)?;
        let serial = state.last_serial + 1;
        let cert = issue_intermediate(&settings, root_pem, key_pem, csr_pem, serial)?;

        self.delegate
            .apply_provider_state_write(ProviderState {
                last_serial: serial,
                ..state
            })
            .await?;
        info!(serial, "signed intermediate certificate");
        Ok(cert)
    }

    async fn cross_sign_ca(&self, cert_pem: &str) -> Result<String> {
        let settings = self.settings()?;
        if settings.config.disable_cross_signing {
            return Err(Error::NotSupported(
                "cross-signing is disabled for this provider".to_string(),
            ));
        }
        if !settings.is_primary {
            return Err(Error::NotPrimary(
                "only the primary datacenter cross-signs".to_string(),
            ));
        }
        let _guard = self.sign_lock.lock().await;

        let state = self.read_state(&settings).await?;
        let (root_pem, key_pem) = signing_material(&settings, &state)?;
        let serial = state.last_serial + 1;
        let cert = issue_cross_signed(root_pem, key_pem, cert_pem, serial)?;

        self.delegate
            .apply_provider_state_write(ProviderState {
                last_serial: serial,
                ..state
            })
            .await?;
        info!(serial, "cross-signed foreign CA certificate");
        Ok(cert)
    }

    fn supports_cross_signing(&self) -> bool {
        self.settings
            .read()
            .as_ref()
            .map_or(true, |s| !s.config.disable_cross_signing)
    }

    async fn cleanup(&self) -> Result<()> {
        let settings = self.settings.write().take();
        if let Some(settings) = settings {
            match self.delegate.apply_provider_state_delete(&settings.id).await {
                Ok(_) => info!(id = %settings.id, "removed CA provider state"),
                Err(e) => warn!(id = %settings.id, error = %e, "failed to remove CA provider state"),
            }
        }
        self.set_phase(ProviderPhase::Destroyed);
        Ok(())
    }
}

/// Derives the state record ID from the key material configuration.
fn provider_state_id(config: &BuiltinProviderConfig, is_primary: bool) -> String {
    hex_sha256(&format!(
        "{},{},{},{},{}",
        config.private_key.as_deref().unwrap_or_default(),
        config.root_cert.as_deref().unwrap_or_default(),
        config.private_key_type,
        config.private_key_bits,
        is_primary
    ))
}

/// IDs used by earlier releases, newest first.
fn legacy_state_ids(config: &BuiltinProviderConfig, is_primary: bool) -> Vec<String> {
    let key = config.private_key.as_deref().unwrap_or_default();
    let root = config.root_cert.as_deref().unwrap_or_default();
    vec![
        hex_sha256(&format!("{key},{root},{is_primary}")),
        format!("{key},{root}"),
    ]
}

fn hex_sha256(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn resume_phase(is_primary: bool, state: &ProviderState) -> ProviderPhase {
    if is_primary {
        if state.root_cert.is_empty() {
            ProviderPhase::Configured
        } else {
            ProviderPhase::RootReady
        }
    } else if !state.intermediate_cert.is_empty() {
        ProviderPhase::IntermediateReady
    } else if !state.pending_private_key.is_empty() {
        ProviderPhase::AwaitingIntermediate
    } else {
        ProviderPhase::Configured
    }
}

/// Rejects operator-supplied key material that cannot be used.
fn check_key_material(config: &BuiltinProviderConfig) -> Result<()> {
    let key = match &config.private_key {
        Some(pem) => {
            let key = PrivateKey::from_pem(pem)
                .map_err(|e| Error::Config(format!("private_key: {e}")))?;
            key.key_pair()
                .map_err(|e| Error::Config(format!("private_key: {e}")))?;
            Some(key)
        }
        None if can_generate(config.private_key_type, config.private_key_bits) => None,
        None => {
            return Err(Error::Config(format!(
                "cannot generate a {} key of {} bits; supply private_key",
                config.private_key_type, config.private_key_bits
            )))
        }
    };

    if let (Some(root_pem), Some(key)) = (&config.root_cert, &key) {
        let root =
            Certificate::from_pem(root_pem).map_err(|e| Error::Config(format!("root_cert: {e}")))?;
        if !root.is_ca()? {
            return Err(Error::Config("root_cert is not a CA certificate".to_string()));
        }
        if !root.matches_key(key)? {
            return Err(Error::Config(
                "root_cert does not match private_key".to_string(),
            ));
        }
    }
    Ok(())
}

/// Returns the certificate that signs leaves and its key.
fn signing_material<'a>(settings: &Settings, state: &'a ProviderState) -> Result<(&'a str, &'a str)> {
    let cert = if settings.is_primary {
        &state.root_cert
    } else {
        &state.intermediate_cert
    };
    if cert.is_empty() || state.private_key.is_empty() {
        return Err(Error::NotInitialized(if settings.is_primary {
            "no root certificate; call generate_root first".to_string()
        } else {
            "no intermediate certificate installed".to_string()
        }));
    }
    Ok((cert.as_str(), state.private_key.as_str()))
}

/// Common name for a CA certificate, e.g.
/// `pri-1a2b3c4d.mesh.ca.6c3a5f5e.mesh`.
fn ca_common_name(settings: &Settings, primary: bool) -> Result<String> {
    let uid = hex::encode(random_bytes::<4>()?);
    let cluster: String = settings.cluster_id.chars().take(8).collect();
    let domain = &settings.signing_id.domain;
    let prefix = if primary { "pri" } else { "sec" };
    Ok(format!("{prefix}-{uid}.{domain}.ca.{cluster}.{domain}"))
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| Error::Signing("system random source failed".to_string()))?;
    Ok(buf)
}

fn validity(ttl: Duration) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let now = OffsetDateTime::now_utc();
    let ttl = time::Duration::try_from(ttl)
        .map_err(|e| Error::Config(format!("TTL out of range: {e}")))?;
    let not_after = now
        .checked_add(ttl)
        .ok_or_else(|| Error::Config("TTL out of range".to_string()))?;
    Ok((now, not_after))
}

fn backdated_validity(ttl: Duration) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let (now, not_after) = validity(ttl)?;
    let skew = time::Duration::try_from(CLOCK_SKEW)
        .map_err(|e| Error::Signing(format!("clock skew out of range: {e}")))?;
    Ok((now - skew, not_after))
}

fn uri_san(uri: String) -> Result<SanType> {
    let ia5 = rcgen::string::Ia5String::try_from(uri)
        .map_err(|e| Error::Validation(format!("invalid SAN URI: {e}")))?;
    Ok(SanType::URI(ia5))
}

fn load_key(key_pem: &str) -> Result<KeyPair> {
    PrivateKey::from_pem(key_pem)?.key_pair()
}

fn generate_root_cert(settings: &Settings, key_pem: &str) -> Result<String> {
    let key = load_key(key_pem)?;
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::Signing(format!("failed to create params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ca_common_name(settings, true)?);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![uri_san(settings.signing_id.uri())?];
    params.serial_number = Some(serial_from_u64(
        (u64::from_be_bytes(random_bytes::<8>()?) & i64::MAX as u64).max(1),
    ));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = validity(settings.config.root_cert_ttl)?;
    params.not_before = not_before;
    params.not_after = not_after;
    params.use_authority_key_identifier_extension = true;

    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Signing(format!("failed to self-sign root: {e}")))?;
    Ok(cert.pem())
}

/// Checks the CSR's signature and that it requests one identity in this
/// trust domain.
fn leaf_identity(csr_pem: &str, signing_id: &SpiffeIdSigning) -> Result<SpiffeId> {
    let uris = verified_csr_uris(csr_pem)?;
    let [uri] = uris.as_slice() else {
        return Err(Error::Validation(format!(
            "CSR must have exactly one URI SAN, found {}",
            uris.len()
        )));
    };
    let id = SpiffeId::parse(uri).map_err(|e| Error::Validation(e.to_string()))?;
    if id.is_signing() {
        return Err(Error::Validation(
            "leaf CSR requests a signing identity; use sign_intermediate".to_string(),
        ));
    }
    if !signing_id.can_sign(&id) {
        return Err(Error::Validation(format!(
            "CSR trust domain {} does not match {}",
            id.host(),
            signing_id.host()
        )));
    }
    Ok(id)
}

/// Intermediate CSRs may omit the URI; when present it must be this trust
/// domain's signing identity.
fn validate_intermediate_csr(csr_pem: &str, signing_id: &SpiffeIdSigning) -> Result<()> {
    let uris = verified_csr_uris(csr_pem)?;
    match uris.as_slice() {
        [] => Ok(()),
        [uri] => {
            let id = SpiffeId::parse(uri).map_err(|e| Error::Validation(e.to_string()))?;
            if !id.is_signing() {
                return Err(Error::Validation(
                    "CSR SAN is not a signing identity".to_string(),
                ));
            }
            if !signing_id.can_sign(&id) {
                return Err(Error::Validation(format!(
                    "CSR trust domain {} does not match {}",
                    id.host(),
                    signing_id.host()
                )));
            }
            Ok(())
        }
        _ => Err(Error::Validation(format!(
            "CSR has too many URI SANs ({})",
            uris.len()
        ))),
    }
}

fn validate_intermediate(
    intermediate: &Certificate,
    root: &Certificate,
    signing_id: &SpiffeIdSigning,
) -> Result<()> {
    if !validation(intermediate.is_ca())? {
        return Err(Error::Validation(
            "intermediate is not a CA certificate".to_string(),
        ));
    }
    let uris = validation(intermediate.uris())?;
    let expected = signing_id.uri();
    match uris.as_slice() {
        [uri] if *uri == expected => {}
        [uri] => {
            return Err(Error::Validation(format!(
                "intermediate URI {uri} does not match {expected}"
            )))
        }
        _ => {
            return Err(Error::Validation(format!(
                "intermediate must have exactly one URI SAN, found {}",
                uris.len()
            )))
        }
    }
    verify_issued_by(intermediate, root)
}

fn issue_leaf(
    settings: &Settings,
    signer_pem: &str,
    key_pem: &str,
    csr_pem: &str,
    id: &SpiffeId,
    serial: u64,
) -> Result<String> {
    let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| Error::Validation(format!("failed to parse CSR: {e}")))?;

    let params = &mut csr.params;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, id.common_name());
    params.distinguished_name = dn;
    params.serial_number = Some(serial_from_u64(serial));
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::KeyAgreement,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let (not_before, not_after) = backdated_validity(settings.config.leaf_cert_ttl)?;
    params.not_before = not_before;
    params.not_after = not_after;
    params.use_authority_key_identifier_extension = true;

    let key = load_key(key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(signer_pem, &key)
        .map_err(|e| Error::Signing(format!("failed to load signing certificate: {e}")))?;
    let cert = csr
        .signed_by(&issuer)
        .map_err(|e| Error::Signing(format!("failed to sign leaf: {e}")))?;
    Ok(cert.pem())
}

fn issue_intermediate(
    settings: &Settings,
    root_pem: &str,
    key_pem: &str,
    csr_pem: &str,
    serial: u64,
) -> Result<String> {
    let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| Error::Validation(format!("failed to parse CSR: {e}")))?;

    let params = &mut csr.params;
    params.serial_number = Some(serial_from_u64(serial));
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = Vec::new();
    let (not_before, not_after) = backdated_validity(settings.config.intermediate_cert_ttl)?;
    params.not_before = not_before;
    params.not_after = not_after;
    params.use_authority_key_identifier_extension = true;

    let key = load_key(key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(root_pem, &key)
        .map_err(|e| Error::Signing(format!("failed to load root certificate: {e}")))?;
    let cert = csr
        .signed_by(&issuer)
        .map_err(|e| Error::Signing(format!("failed to sign intermediate: {e}")))?;
    Ok(cert.pem())
}

fn issue_cross_signed(root_pem: &str, key_pem: &str, cert_pem: &str, serial: u64) -> Result<String> {
    let foreign = validation(Certificate::from_pem(cert_pem))?;
    if !validation(foreign.is_ca())? {
        return Err(Error::Validation(
            "only CA certificates can be cross-signed".to_string(),
        ));
    }

    // Subject, SANs and SKI must match the foreign root for chains through
    // either root to resolve.
    let mut params = CertificateParams::default();
    params.distinguished_name = validation(foreign.subject_dn())?;
    params.subject_alt_names = validation(foreign.uris())?
        .into_iter()
        .map(uri_san)
        .collect::<Result<Vec<_>>>()?;
    params.is_ca = match validation(foreign.max_path_len())? {
        Some(len) => IsCa::Ca(BasicConstraints::Constrained(
            u8::try_from(len).unwrap_or(u8::MAX),
        )),
        None => IsCa::Ca(BasicConstraints::Unconstrained),
    };
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    if let Some(ski) = validation(foreign.subject_key_id())? {
        params.key_identifier_method = KeyIdMethod::PreSpecified(ski);
    }
    params.serial_number = Some(serial_from_u64(serial));
    let (not_before, not_after) = backdated_validity(CROSS_SIGN_TTL)?;
    params.not_before = not_before;
    params.not_after = not_after;
    params.use_authority_key_identifier_extension = true;

    let public_key = SubjectPublicKeyInfo::from_der(&validation(foreign.public_key_der())?)
        .map_err(|e| Error::Validation(format!("unsupported public key: {e}")))?;

    let key = load_key(key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(root_pem, &key)
        .map_err(|e| Error::Signing(format!("failed to load root certificate: {e}")))?;
    let cert = params
        .signed_by(&public_key, &issuer)
        .map_err(|e| Error::Signing(format!("failed to cross-sign: {e}")))?;
    Ok(cert.pem())
}

/// Reports certificate parse failures on caller input as validation errors.
fn validation<T>(result: Result<T>) -> Result<T> {
    result.map_err(|e| match e {
        Error::Certificate(msg) => Error::Validation(msg),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roots::CaRoot;
    use crate::state::InMemoryStateDelegate;

    const CLUSTER: &str = "6c3a5f5e-9c4b-4a25-8b1e-5d0c2f3e4a11";

    fn web_uri() -> String {
        format!("spiffe://{CLUSTER}.mesh/ns/default/dc/dc1/svc/web")
    }

    async fn primary() -> (Arc<InMemoryStateDelegate>, BuiltinProvider<InMemoryStateDelegate>) {
        let delegate = Arc::new(InMemoryStateDelegate::new());
        let provider = BuiltinProvider::new(delegate.clone());
        provider
            .configure(&ProviderConfig::new(CLUSTER, true))
            .await
            .unwrap();
        (delegate, provider)
    }

    #[tokio::test]
    async fn test_configure_writes_initial_state() {
        let (delegate, provider) = primary().await;
        let id = provider.state_id().unwrap();
        assert_eq!(id.len(), 64);
        let (_, state) = delegate.read_provider_state(&id).await.unwrap().unwrap();
        assert!(state.root_cert.is_empty());
        assert_eq!(provider.phase(), ProviderPhase::Configured);
    }

    #[tokio::test]
    async fn test_configure_requires_cluster_id() {
        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        let err = provider
            .configure(&ProviderConfig::new("", true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(provider.phase(), ProviderPhase::Unconfigured);
    }

    #[tokio::test]
    async fn test_configure_rejects_ungeneratable_key() {
        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        let config = ProviderConfig::new(CLUSTER, true)
            .with("private_key_type", "ec")
            .with("private_key_bits", 521)
            .with("skip_validate", true);
        assert!(matches!(
            provider.configure(&config).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_rsa_root_signs_leaves() {
        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        provider
            .configure(
                &ProviderConfig::new(CLUSTER, true)
                    .with("private_key_type", "rsa")
                    .with("private_key_bits", 2048),
            )
            .await
            .unwrap();
        provider.generate_root().await.unwrap();

        let root = Certificate::from_pem(&provider.active_root().await.unwrap()).unwrap();
        let csr = CsrOptions::new(web_uri()).generate().unwrap();
        let leaf = Certificate::from_pem(&provider.sign(csr.csr()).await.unwrap()).unwrap();
        verify_issued_by(&leaf, &root).unwrap();
        assert_eq!(leaf.serial_number().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_generate_root() {
        let (_, provider) = primary().await;
        provider.generate_root().await.unwrap();
        assert_eq!(provider.phase(), ProviderPhase::RootReady);

        let root = Certificate::from_pem(&provider.active_root().await.unwrap()).unwrap();
        assert!(root.is_ca().unwrap());
        assert_eq!(root.uris().unwrap(), vec![format!("spiffe://{CLUSTER}.mesh")]);
        assert!(root.subject().unwrap().contains(".mesh.ca.6c3a5f5e.mesh"));
        assert!(root.subject_key_id().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_generate_root_on_secondary() {
        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        provider
            .configure(&ProviderConfig::new(CLUSTER, false))
            .await
            .unwrap();
        assert!(matches!(
            provider.generate_root().await,
            Err(Error::NotPrimary(_))
        ));
    }

    #[tokio::test]
    async fn test_active_root_before_generate() {
        let (_, provider) = primary().await;
        assert!(matches!(
            provider.active_root().await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_leaf() {
        let (_, provider) = primary().await;
        provider.generate_root().await.unwrap();

        let csr = CsrOptions::new(web_uri()).generate().unwrap();
        let leaf = Certificate::from_pem(&provider.sign(csr.csr()).await.unwrap()).unwrap();

        assert_eq!(leaf.uris().unwrap(), vec![web_uri()]);
        assert_eq!(leaf.serial_number().unwrap(), 1);
        assert!(!leaf.is_ca().unwrap());
        assert_eq!(leaf.subject().unwrap(), "CN=web");
        assert_eq!(provider.phase(), ProviderPhase::Active);

        let root = Certificate::from_pem(&provider.active_root().await.unwrap()).unwrap();
        verify_issued_by(&leaf, &root).unwrap();
        assert_eq!(
            leaf.authority_key_id().unwrap(),
            root.subject_key_id().unwrap()
        );
    }

    #[tokio::test]
    async fn test_sign_rejects_foreign_domain() {
        let (_, provider) = primary().await;
        provider.generate_root().await.unwrap();

        let csr = CsrOptions::new("spiffe://other.mesh/ns/default/dc/dc1/svc/web")
            .generate()
            .unwrap();
        assert!(matches!(
            provider.sign(csr.csr()).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_rejects_signing_identity() {
        let (_, provider) = primary().await;
        provider.generate_root().await.unwrap();

        let csr = CsrOptions::new(format!("spiffe://{CLUSTER}.mesh"))
            .generate()
            .unwrap();
        assert!(matches!(
            provider.sign(csr.csr()).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_before_root() {
        let (_, provider) = primary().await;
        let csr = CsrOptions::new(web_uri()).generate().unwrap();
        assert!(matches!(
            provider.sign(csr.csr()).await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_consume_serial() {
        let (delegate, provider) = primary().await;
        provider.generate_root().await.unwrap();
        let csr = CsrOptions::new(web_uri()).generate().unwrap();

        delegate.set_unavailable(true);
        assert!(provider.sign(csr.csr()).await.unwrap_err().is_retryable());
        delegate.set_unavailable(false);

        let leaf = Certificate::from_pem(&provider.sign(csr.csr()).await.unwrap()).unwrap();
        assert_eq!(leaf.serial_number().unwrap(), 1);
    }

    #[test]
    fn test_state_id_changes_with_key_settings() {
        let a = provider_state_id(&BuiltinProviderConfig::default(), true);
        let b = provider_state_id(&BuiltinProviderConfig::default(), false);
        let c = provider_state_id(
            &BuiltinProviderConfig {
                private_key_bits: 384,
                ..Default::default()
            },
            true,
        );
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_legacy_state_is_migrated() {
        let delegate = Arc::new(InMemoryStateDelegate::new());
        let config = BuiltinProviderConfig::default();
        let legacy_id = legacy_state_ids(&config, true).remove(1);
        delegate
            .apply_provider_state_write(ProviderState {
                id: legacy_id.clone(),
                root_cert: "legacy-root".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let provider = BuiltinProvider::new(delegate.clone());
        provider
            .configure(&ProviderConfig::new(CLUSTER, true))
            .await
            .unwrap();

        let id = provider.state_id().unwrap();
        let (_, state) = delegate.read_provider_state(&id).await.unwrap().unwrap();
        assert_eq!(state.root_cert, "legacy-root");
        assert!(delegate
            .read_provider_state(&legacy_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(provider.phase(), ProviderPhase::RootReady);
    }

    #[tokio::test]
    async fn test_operator_supplied_root() {
        let key = generate_key_pair(crate::config::KeyType::Ec, 256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root_pem = params.self_signed(&key).unwrap().pem();

        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        provider
            .configure(
                &ProviderConfig::new(CLUSTER, true)
                    .with("private_key", key.serialize_pem())
                    .with("root_cert", root_pem.clone()),
            )
            .await
            .unwrap();
        provider.generate_root().await.unwrap();
        assert_eq!(provider.active_root().await.unwrap(), root_pem);

        // rcgen derives a 20-byte serial when none is set.
        let root = CaRoot::from_pem("operator", &root_pem).unwrap();
        assert!(root.serial_number.split(':').count() > 8);
    }

    #[tokio::test]
    async fn test_sign_rate_limited() {
        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        provider
            .configure(&ProviderConfig::new(CLUSTER, true).with("csr_max_per_second", 1.0))
            .await
            .unwrap();
        provider.generate_root().await.unwrap();

        let csr = CsrOptions::new(web_uri()).generate().unwrap();
        provider.sign(csr.csr()).await.unwrap();
        let err = provider.sign(csr.csr()).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_sign_concurrency_limit_releases() {
        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        provider
            .configure(
                &ProviderConfig::new(CLUSTER, true)
                    .with("csr_max_per_second", 0)
                    .with("csr_max_concurrent", 1),
            )
            .await
            .unwrap();
        provider.generate_root().await.unwrap();

        let csr = CsrOptions::new(web_uri()).generate().unwrap();
        for _ in 0..5 {
            provider.sign(csr.csr()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_operator_root_must_match_key() {
        let key = generate_key_pair(crate::config::KeyType::Ec, 256).unwrap();
        let other = generate_key_pair(crate::config::KeyType::Ec, 256).unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root_pem = params.self_signed(&other).unwrap().pem();

        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        let result = provider
            .configure(
                &ProviderConfig::new(CLUSTER, true)
                    .with("private_key", key.serialize_pem())
                    .with("root_cert", root_pem),
            )
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_cross_signing_disabled() {
        let provider = BuiltinProvider::new(Arc::new(InMemoryStateDelegate::new()));
        provider
            .configure(&ProviderConfig::new(CLUSTER, true).with("disable_cross_signing", true))
            .await
            .unwrap();
        provider.generate_root().await.unwrap();
        assert!(!provider.supports_cross_signing());

        let root = provider.active_root().await.unwrap();
        assert!(matches!(
            provider.cross_sign_ca(&root).await,
            Err(Error::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (delegate, provider) = primary().await;
        provider.generate_root().await.unwrap();
        let id = provider.state_id().unwrap();

        provider.cleanup().await.unwrap();
        provider.cleanup().await.unwrap();
        assert_eq!(provider.phase(), ProviderPhase::Destroyed);
        assert!(delegate.read_provider_state(&id).await.unwrap().is_none());
        assert!(matches!(
            provider.active_root().await,
            Err(Error::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_swallows_backend_errors() {
        let (delegate, provider) = primary().await;
        delegate.set_unavailable(true);
        provider.cleanup().await.unwrap();
        assert_eq!(provider.phase(), ProviderPhase::Destroyed);
    }
}
