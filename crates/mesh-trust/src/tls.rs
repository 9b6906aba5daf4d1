//! Hot-reloadable TLS configuration.
//!
//! A [`TlsConfigurator`] holds one immutable [`TlsSnapshot`] at a time.
//! [`TlsConfigurator::reload`] builds a complete new snapshot from PEM
//! material and swaps it in; connections already established keep the
//! configuration they captured, and the next accepted or dialed connection
//! uses the new one.
//!
//! # Security Model
//!
//! - Both sides present certificates issued by the mesh CA
//! - Peer chains are validated against the trust bundle
//! - Peers must carry an identity in the local trust domain

use crate::certificate::{parse_cert_chain_pem, Certificate, PrivateKey, TrustBundle};
use crate::spiffe::SpiffeId;
use crate::verifier::{SpiffeServerVerifier, TrustDomainVerifier};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::Acceptor;
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, LazyConfigAcceptor, TlsConnector};
use tracing::{debug, info};

/// One immutable generation of TLS material.
#[derive(Debug)]
pub struct TlsSnapshot {
    version: u64,
    leaf: Certificate,
    identity: SpiffeId,
    trust_bundle: TrustBundle,
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
}

impl TlsSnapshot {
    fn build(version: u64, cert_chain_pem: &str, key_pem: &str, bundle_pem: &str) -> Result<Self> {
        let _ = default_provider().install_default();

        let chain = parse_cert_chain_pem(cert_chain_pem)?;
        let Some(leaf) = chain.first().cloned() else {
            return Err(Error::Certificate(
                "no certificates found in chain".to_string(),
            ));
        };
        let key = PrivateKey::from_pem(key_pem)?;
        if !leaf.matches_key(&key)? {
            return Err(Error::Validation(
                "private key does not match the leaf certificate".to_string(),
            ));
        }
        let identity = leaf.spiffe_id()?;
        let trust_bundle = TrustBundle::from_pem(bundle_pem)?;
        if trust_bundle.is_empty() {
            return Err(Error::Validation("trust bundle is empty".to_string()));
        }

        let trust_domain = identity.host();
        let cert_chain: Vec<CertificateDer<'static>> =
            chain.iter().map(Certificate::to_rustls).collect();

        let client_verifier = TrustDomainVerifier::new(trust_domain.clone(), &trust_bundle)?;
        let server_config = ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(client_verifier))
            .with_single_cert(cert_chain.clone(), key.to_rustls()?)
            .map_err(|e| Error::Certificate(format!("failed to build server config: {e}")))?;

        let server_verifier = SpiffeServerVerifier::new(trust_domain, &trust_bundle)?;
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(server_verifier))
            .with_client_auth_cert(cert_chain, key.to_rustls()?)
            .map_err(|e| Error::Certificate(format!("failed to build client config: {e}")))?;

        Ok(Self {
            version,
            leaf,
            identity,
            trust_bundle,
            server_config: Arc::new(server_config),
            client_config: Arc::new(client_config),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn leaf(&self) -> &Certificate {
        &self.leaf
    }

    /// Identity presented by this snapshot's leaf.
    pub fn identity(&self) -> &SpiffeId {
        &self.identity
    }

    pub fn trust_bundle(&self) -> &TrustBundle {
        &self.trust_bundle
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }
}

/// Holder of the current [`TlsSnapshot`].
#[derive(Debug, Default)]
pub struct TlsConfigurator {
    current: RwLock<Option<Arc<TlsSnapshot>>>,
    reload_lock: Mutex<()>,
}

impl TlsConfigurator {
    /// Creates an empty configurator; [`reload`](Self::reload) must succeed
    /// before connections can be served.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configurator holding the given material.
    pub fn from_pem(cert_chain_pem: &str, key_pem: &str, bundle_pem: &str) -> Result<Self> {
        let configurator = Self::new();
        configurator.reload(cert_chain_pem, key_pem, bundle_pem)?;
        Ok(configurator)
    }

    /// Builds a new snapshot and makes it current. Returns its version.
    ///
    /// On error the current snapshot is left unchanged.
    pub fn reload(&self, cert_chain_pem: &str, key_pem: &str, bundle_pem: &str) -> Result<u64> {
        let _guard = self.reload_lock.lock();
        let version = self.version() + 1;
        let snapshot = TlsSnapshot::build(version, cert_chain_pem, key_pem, bundle_pem)?;
        info!(
            version,
            identity = %snapshot.identity,
            serial = snapshot.leaf.serial_number().unwrap_or_default(),
            roots = snapshot.trust_bundle.roots().len(),
            "reloaded TLS configuration"
        );
        *self.current.write() = Some(Arc::new(snapshot));
        Ok(version)
    }

    /// Returns the current snapshot.
    pub fn get(&self) -> Result<Arc<TlsSnapshot>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| Error::NotInitialized("no TLS material loaded".to_string()))
    }

    /// Version of the current snapshot; 0 before the first reload.
    pub fn version(&self) -> u64 {
        self.current.read().as_ref().map_or(0, |snapshot| snapshot.version)
    }

    /// Completes a server-side handshake using the snapshot current when the
    /// client hello arrives.
    pub async fn accept<IO>(&self, stream: IO) -> Result<server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let snapshot = self.get()?;
        debug!(version = snapshot.version, "accepting TLS connection");
        Ok(start.into_stream(snapshot.server_config()).await?)
    }

    /// Returns a connector bound to the current snapshot.
    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(self.get()?.client_config()))
    }

    /// Completes a client-side handshake using the current snapshot.
    ///
    /// The server is authenticated by identity, so the server name sent is
    /// the local trust domain.
    pub async fn connect<IO>(&self, stream: IO) -> Result<client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let snapshot = self.get()?;
        let server_name = server_name_from_trust_domain(&snapshot.identity.host())?;
        let connector = TlsConnector::from(snapshot.client_config());
        Ok(connector.connect(server_name, stream).await?)
    }
}

/// Server name sent by mesh clients; mesh servers ignore it.
pub fn server_name_from_trust_domain(trust_domain: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(trust_domain.to_string())
        .map_err(|e| Error::Certificate(format!("invalid server name '{trust_domain}': {e}")))
}

/// Returns the identity of the client on an accepted connection.
pub fn client_identity<IO>(stream: &server::TlsStream<IO>) -> Result<SpiffeId> {
    let (_, conn) = stream.get_ref();
    match conn.peer_certificates().and_then(|certs| certs.first()) {
        Some(cert) => crate::verifier::peer_identity(cert.as_ref()),
        None => Err(Error::Validation(
            "peer presented no certificate".to_string(),
        )),
    }
}
