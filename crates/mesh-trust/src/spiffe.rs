//! SPIFFE identity URIs used as the subject of every mesh certificate.
//!
//! Five identity kinds share one trust-domain host and differ only by path
//! shape:
//!
//! ```text
//! spiffe://<host>[/ap/<partition>]/ns/<namespace>/dc/<dc>/svc/<service>
//! spiffe://<host>[/ap/<partition>]/agent/client/dc/<dc>/id/<agent>
//! spiffe://<host>/agent/server/dc/<dc>
//! spiffe://<host>[/ap/<partition>]/gateway/mesh/dc/<dc>
//! spiffe://<cluster-id>.<domain>
//! ```
//!
//! The partition segment is omitted when it is the default partition.
//!
//! # Example
//!
//! ```
//! use mesh_trust::spiffe::{SpiffeId, SpiffeIdService};
//!
//! let id = SpiffeIdService::new("11111111.mesh", "dc1", "web");
//! let uri = id.uri();
//! assert_eq!(uri, "spiffe://11111111.mesh/ns/default/dc/dc1/svc/web");
//! assert_eq!(SpiffeId::parse(&uri).unwrap(), SpiffeId::Service(id));
//! ```

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// URI scheme prefix for every identity.
pub const SPIFFE_SCHEME: &str = "spiffe://";

/// Partition and namespace used when none is given.
pub const DEFAULT_TENANT: &str = "default";

/// Domain suffix of the signing authority host.
pub const DEFAULT_SIGNING_DOMAIN: &str = "mesh";

const MAX_URI_LEN: usize = 2048;

/// Identity of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeIdService {
    pub host: String,
    pub partition: String,
    pub namespace: String,
    pub datacenter: String,
    pub service: String,
}

impl SpiffeIdService {
    /// Creates a service identity in the default partition and namespace.
    pub fn new(
        host: impl Into<String>,
        datacenter: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            partition: DEFAULT_TENANT.to_string(),
            namespace: DEFAULT_TENANT.to_string(),
            datacenter: datacenter.into(),
            service: service.into(),
        }
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the admin partition.
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn uri(&self) -> String {
        format!(
            "{SPIFFE_SCHEME}{}{}/ns/{}/dc/{}/svc/{}",
            self.host,
            partition_prefix(&self.partition),
            or_default(&self.namespace),
            self.datacenter,
            self.service
        )
    }
}

/// Identity of a client agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeIdAgent {
    pub host: String,
    pub partition: String,
    pub datacenter: String,
    pub agent: String,
}

impl SpiffeIdAgent {
    pub fn new(
        host: impl Into<String>,
        datacenter: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            partition: DEFAULT_TENANT.to_string(),
            datacenter: datacenter.into(),
            agent: agent.into(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn uri(&self) -> String {
        format!(
            "{SPIFFE_SCHEME}{}{}/agent/client/dc/{}/id/{}",
            self.host,
            partition_prefix(&self.partition),
            self.datacenter,
            self.agent
        )
    }
}

/// Identity of a control-plane server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeIdServer {
    pub host: String,
    pub datacenter: String,
}

impl SpiffeIdServer {
    pub fn new(host: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            datacenter: datacenter.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!(
            "{SPIFFE_SCHEME}{}/agent/server/dc/{}",
            self.host, self.datacenter
        )
    }
}

/// Identity of a mesh gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeIdMeshGateway {
    pub host: String,
    pub partition: String,
    pub datacenter: String,
}

impl SpiffeIdMeshGateway {
    pub fn new(host: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            partition: DEFAULT_TENANT.to_string(),
            datacenter: datacenter.into(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn uri(&self) -> String {
        format!(
            "{SPIFFE_SCHEME}{}{}/gateway/mesh/dc/{}",
            self.host,
            partition_prefix(&self.partition),
            self.datacenter
        )
    }
}

/// Identity of the signing authority for a trust domain.
///
/// The host is `<cluster_id>.<domain>` and the path is empty. Every other
/// identity the authority signs must carry the same host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeIdSigning {
    pub cluster_id: String,
    pub domain: String,
}

impl SpiffeIdSigning {
    /// Creates a signing identity under [`DEFAULT_SIGNING_DOMAIN`].
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            domain: DEFAULT_SIGNING_DOMAIN.to_string(),
        }
    }

    /// Returns the trust domain host.
    pub fn host(&self) -> String {
        format!("{}.{}", self.cluster_id, self.domain)
    }

    pub fn uri(&self) -> String {
        format!("{SPIFFE_SCHEME}{}", self.host())
    }

    /// Returns true if this authority may sign a certificate for `id`.
    ///
    /// Hosts are compared case-insensitively.
    pub fn can_sign(&self, id: &SpiffeId) -> bool {
        id.host().eq_ignore_ascii_case(&self.host())
    }
}

/// Any identity that can appear in a mesh certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpiffeId {
    Service(SpiffeIdService),
    Agent(SpiffeIdAgent),
    Server(SpiffeIdServer),
    MeshGateway(SpiffeIdMeshGateway),
    Signing(SpiffeIdSigning),
}

impl SpiffeId {
    /// Parses a SPIFFE URI, determining the kind from its path shape.
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.len() > MAX_URI_LEN {
            return Err(Error::UnrecognizedFormat(format!(
                "URI exceeds maximum length ({MAX_URI_LEN} bytes)"
            )));
        }
        if !uri.is_ascii() {
            return Err(Error::UnrecognizedFormat(format!("non-ASCII URI: {uri}")));
        }

        let rest = uri
            .strip_prefix(SPIFFE_SCHEME)
            .ok_or_else(|| Error::UnrecognizedFormat(format!("not a spiffe:// URI: {uri}")))?;

        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        validate_host(host).map_err(|_| unrecognized(uri))?;

        if path.is_empty() {
            return parse_signing(host).ok_or_else(|| unrecognized(uri));
        }

        let segments: Vec<&str> = path[1..].split('/').collect();
        for seg in &segments {
            validate_path_component(seg).map_err(|_| unrecognized(uri))?;
        }

        // Optional admin partition prefix.
        let (partition, tail) = match segments.as_slice() {
            ["ap", partition, tail @ ..] => (Some(*partition), tail),
            tail => (None, tail),
        };
        let host = host.to_string();
        let partition_or_default = partition.unwrap_or(DEFAULT_TENANT).to_string();

        let id = match tail {
            ["ns", ns, "dc", dc, "svc", svc] => SpiffeId::Service(SpiffeIdService {
                host,
                partition: partition_or_default,
                namespace: ns.to_string(),
                datacenter: dc.to_string(),
                service: svc.to_string(),
            }),
            ["agent", "client", "dc", dc, "id", agent] => SpiffeId::Agent(SpiffeIdAgent {
                host,
                partition: partition_or_default,
                datacenter: dc.to_string(),
                agent: agent.to_string(),
            }),
            ["agent", "server", "dc", dc] if partition.is_none() => {
                SpiffeId::Server(SpiffeIdServer {
                    host,
                    datacenter: dc.to_string(),
                })
            }
            ["gateway", "mesh", "dc", dc] => SpiffeId::MeshGateway(SpiffeIdMeshGateway {
                host,
                partition: partition_or_default,
                datacenter: dc.to_string(),
            }),
            _ => return Err(unrecognized(uri)),
        };
        Ok(id)
    }

    pub fn uri(&self) -> String {
        match self {
            SpiffeId::Service(id) => id.uri(),
            SpiffeId::Agent(id) => id.uri(),
            SpiffeId::Server(id) => id.uri(),
            SpiffeId::MeshGateway(id) => id.uri(),
            SpiffeId::Signing(id) => id.uri(),
        }
    }

    /// Returns the trust domain host of this identity.
    pub fn host(&self) -> String {
        match self {
            SpiffeId::Service(id) => id.host.clone(),
            SpiffeId::Agent(id) => id.host.clone(),
            SpiffeId::Server(id) => id.host.clone(),
            SpiffeId::MeshGateway(id) => id.host.clone(),
            SpiffeId::Signing(id) => id.host(),
        }
    }

    /// Returns a short name suitable for a certificate common name.
    pub fn common_name(&self) -> String {
        match self {
            SpiffeId::Service(id) => id.service.clone(),
            SpiffeId::Agent(id) => id.agent.clone(),
            SpiffeId::Server(id) => format!("server.{}.{}", id.datacenter, id.host),
            SpiffeId::MeshGateway(id) => format!("mesh-gateway.{}", id.datacenter),
            SpiffeId::Signing(id) => id.host(),
        }
    }

    pub fn is_signing(&self) -> bool {
        matches!(self, SpiffeId::Signing(_))
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SpiffeIdService> for SpiffeId {
    fn from(id: SpiffeIdService) -> Self {
        SpiffeId::Service(id)
    }
}

impl From<SpiffeIdAgent> for SpiffeId {
    fn from(id: SpiffeIdAgent) -> Self {
        SpiffeId::Agent(id)
    }
}

impl From<SpiffeIdServer> for SpiffeId {
    fn from(id: SpiffeIdServer) -> Self {
        SpiffeId::Server(id)
    }
}

impl From<SpiffeIdMeshGateway> for SpiffeId {
    fn from(id: SpiffeIdMeshGateway) -> Self {
        SpiffeId::MeshGateway(id)
    }
}

impl From<SpiffeIdSigning> for SpiffeId {
    fn from(id: SpiffeIdSigning) -> Self {
        SpiffeId::Signing(id)
    }
}

/// Returns `value`, or the default tenant if it is empty.
pub fn or_default(value: &str) -> &str {
    if value.is_empty() {
        DEFAULT_TENANT
    } else {
        value
    }
}

fn partition_prefix(partition: &str) -> String {
    let partition = or_default(partition);
    if partition == DEFAULT_TENANT {
        String::new()
    } else {
        format!("/ap/{partition}")
    }
}

fn parse_signing(host: &str) -> Option<SpiffeId> {
    let (cluster_id, domain) = host.split_once('.')?;
    if cluster_id.is_empty() || domain.is_empty() {
        return None;
    }
    Some(SpiffeId::Signing(SpiffeIdSigning {
        cluster_id: cluster_id.to_string(),
        domain: domain.to_string(),
    }))
}

fn unrecognized(uri: &str) -> Error {
    Error::UnrecognizedFormat(uri.to_string())
}

fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::UnrecognizedFormat("empty trust domain".to_string()));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(Error::UnrecognizedFormat(format!(
            "invalid trust domain characters: {host}"
        )));
    }
    Ok(())
}

/// Validates a single path segment.
///
/// Segments must be non-empty, contain only `[a-zA-Z0-9._-]`, and must not
/// be a relative path modifier.
pub fn validate_path_component(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::UnrecognizedFormat("empty path segment".to_string()));
    }
    if value.len() > 253 {
        return Err(Error::UnrecognizedFormat(format!(
            "path segment exceeds maximum length (253 bytes): {} bytes",
            value.len()
        )));
    }
    if value == "." || value == ".." {
        return Err(Error::UnrecognizedFormat(format!(
            "relative path modifier not allowed: {value}"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(Error::UnrecognizedFormat(format!(
            "invalid character '{}' in path segment: {value}",
            c.escape_default()
        )));
    }
    Ok(())
}
