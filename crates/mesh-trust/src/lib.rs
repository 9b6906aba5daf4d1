//! Trust core for a service-mesh control plane.
//!
//! This crate owns the certificate authority lifecycle for mesh workloads and
//! the identity checks applied to every mTLS connection between them.
//!
//! # Components
//!
//! - [`spiffe`] - SPIFFE identity URIs for services, agents, servers, gateways and signing authorities
//! - [`intention`] - Allow/deny intention matching between service identities
//! - [`ca`] - The CA [`Provider`](ca::Provider) trait and the built-in provider
//! - [`config`] - Typed provider configuration with defaults and validation
//! - [`state`] - The state delegate contract and an in-memory implementation
//! - [`roots`] - CA root records and the indexed set of trusted roots
//! - [`certificate`] - X.509 certificate, key and trust bundle handling
//! - [`csr`] - CSR generation for leaves and intermediate CAs
//! - [`verifier`] - Chain verification and SPIFFE-aware rustls verifiers
//! - [`tls`] - Hot-reloadable TLS configuration
//! - [`limit`] - Rate and concurrency limits on leaf signing
//! - [`authz`] - Connection-time authorization using intentions

pub mod authz;
pub mod ca;
pub mod certificate;
pub mod config;
pub mod csr;
pub mod intention;
pub mod limit;
pub mod roots;
pub mod spiffe;
pub mod state;
pub mod tls;
pub mod verifier;

pub use authz::{ConnectAuthorizer, DefaultPolicy};
pub use ca::{BuiltinProvider, Provider, ProviderPhase};
pub use certificate::{Certificate, PrivateKey, TrustBundle};
pub use config::{BuiltinProviderConfig, KeyType, ProviderConfig};
pub use csr::{CertSign, CsrOptions};
pub use intention::{Authorization, Intention, IntentionAction, MatchType};
pub use roots::{CaRoot, IndexedCaRoots};
pub use spiffe::{
    SpiffeId, SpiffeIdAgent, SpiffeIdMeshGateway, SpiffeIdServer, SpiffeIdService,
    SpiffeIdSigning,
};
pub use state::{InMemoryStateDelegate, ProviderState, StateDelegate};
pub use tls::{TlsConfigurator, TlsSnapshot};
pub use verifier::{SpiffeServerVerifier, TrustDomainVerifier};

/// Errors that can occur in mesh-trust operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing provider configuration.
    #[error("invalid CA provider configuration: {0}")]
    Config(String),

    /// Operation requires the primary datacenter's provider.
    #[error("provider is not the primary datacenter: {0}")]
    NotPrimary(String),

    /// Operation is only valid on a secondary datacenter's provider.
    #[error("provider is the primary datacenter: {0}")]
    IsPrimary(String),

    /// A certificate or CSR failed a structural or trust-domain check.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The state delegate or an external backend is unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Signing request rejected by the configured CSR limits.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Cryptographic signing failure.
    #[error("signing failed: {0}")]
    Signing(String),

    /// A URI did not match any known identity shape.
    #[error("unrecognized SPIFFE ID format: {0}")]
    UnrecognizedFormat(String),

    /// The provider has no material for the requested operation yet.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Certificate, key or PEM parsing error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Trust domain mismatch.
    #[error("trust domain mismatch: expected {expected}, got {actual}")]
    TrustDomainMismatch { expected: String, actual: String },

    /// Operation not supported by this provider or configuration.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_) | Error::RateLimited(_))
    }
}

/// Result type for mesh-trust operations.
pub type Result<T> = std::result::Result<T, Error>;
