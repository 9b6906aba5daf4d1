//! Certificate Authority provider trait and the built-in implementation.
//!
//! A [`Provider`] owns the signing material for one datacenter. The primary
//! datacenter's provider holds the root; secondaries generate a CSR, have the
//! primary sign it with [`Provider::sign_intermediate`], and install the
//! result with [`Provider::set_intermediate`].
//!
//! External backends implement the same trait; any RPC transport for
//! out-of-process providers wraps a `Provider` rather than living here.

mod builtin;

pub use builtin::BuiltinProvider;

use crate::config::ProviderConfig;
use crate::Result;
use async_trait::async_trait;
use std::fmt;

/// Lifecycle phase of a provider.
///
/// ```text
/// Unconfigured -> Configured -> RootReady -> IntermediateReady -> Active   (primary)
/// Unconfigured -> Configured -> AwaitingIntermediate -> IntermediateReady -> Active   (secondary)
/// Active -> AwaitingIntermediate   (secondary rotation; the old intermediate keeps signing)
/// any -> Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderPhase {
    Unconfigured,
    Configured,
    RootReady,
    AwaitingIntermediate,
    IntermediateReady,
    Active,
    Destroyed,
}

impl fmt::Display for ProviderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderPhase::Unconfigured => "unconfigured",
            ProviderPhase::Configured => "configured",
            ProviderPhase::RootReady => "root-ready",
            ProviderPhase::AwaitingIntermediate => "awaiting-intermediate",
            ProviderPhase::IntermediateReady => "intermediate-ready",
            ProviderPhase::Active => "active",
            ProviderPhase::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// A certificate authority for mesh identities.
///
/// All certificates, CSRs and keys are PEM strings.
///
/// Lifecycle operations (`configure`, `generate_root`, `set_intermediate`,
/// `generate_intermediate`) assume a single writer; concurrent calls during
/// a rotation are a caller bug. Signing operations may be called
/// concurrently.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Applies configuration.
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for invalid or missing
    /// fields.
    async fn configure(&self, config: &ProviderConfig) -> Result<()>;

    /// Creates the root if none exists. Idempotent.
    ///
    /// Returns [`Error::NotPrimary`](crate::Error::NotPrimary) on a secondary.
    async fn generate_root(&self) -> Result<()>;

    /// Returns the root certificate.
    async fn active_root(&self) -> Result<String>;

    /// Creates a CSR for this provider's intermediate.
    ///
    /// Returns [`Error::IsPrimary`](crate::Error::IsPrimary) on a primary.
    async fn generate_intermediate_csr(&self) -> Result<String>;

    /// Installs an intermediate signed by `root`.
    ///
    /// The intermediate must be a CA certificate with exactly one URI SAN
    /// equal to this provider's signing identity, signed by `root`, and
    /// holding this provider's key. Anything else is
    /// [`Error::Validation`](crate::Error::Validation).
    async fn set_intermediate(&self, intermediate_pem: &str, root_pem: &str) -> Result<()>;

    /// Returns the certificate currently signing leaves.
    ///
    /// For a single-tier primary this is the root.
    async fn active_intermediate(&self) -> Result<String>;

    /// Prepares and returns the certificate that will sign leaves.
    async fn generate_intermediate(&self) -> Result<String>;

    /// Signs a leaf CSR.
    ///
    /// The CSR's identity must belong to this provider's trust domain. Each
    /// call returns a certificate with a serial strictly greater than any
    /// previously issued by this provider.
    async fn sign(&self, csr_pem: &str) -> Result<String>;

    /// Signs a CA CSR from a secondary datacenter with path length 0.
    async fn sign_intermediate(&self, csr_pem: &str) -> Result<String>;

    /// Re-issues a foreign CA certificate under this provider's key.
    ///
    /// Subject, SANs, public key and subject key identifier are preserved.
    async fn cross_sign_ca(&self, cert_pem: &str) -> Result<String>;

    /// Whether [`cross_sign_ca`](Provider::cross_sign_ca) is available.
    fn supports_cross_signing(&self) -> bool;

    /// Releases backend resources. Idempotent and best-effort: failures are
    /// logged, never returned.
    async fn cleanup(&self) -> Result<()>;
}
