//! Connection-time authorization.
//!
//! After the TLS handshake has proven the client's identity, the destination
//! asks [`ConnectAuthorizer`] whether that source may connect. Intentions are
//! read from the state delegate on every call so changes apply to the next
//! connection.

use crate::intention::{authorize, evaluate, Authorization, MatchType};
use crate::spiffe::{SpiffeId, SpiffeIdService};
use crate::state::StateDelegate;
use crate::verifier::peer_identity;
use crate::{Error, Result};
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tracing::debug;

/// Decision when no intention applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultPolicy {
    Allow,
    #[default]
    Deny,
}

impl DefaultPolicy {
    fn allows(self) -> bool {
        self == DefaultPolicy::Allow
    }
}

/// Authorizes service-to-service connections against intentions.
pub struct ConnectAuthorizer<D: StateDelegate> {
    delegate: Arc<D>,
    trust_domain: String,
    default_policy: DefaultPolicy,
}

impl<D: StateDelegate> ConnectAuthorizer<D> {
    pub fn new(delegate: Arc<D>, trust_domain: impl Into<String>, default_policy: DefaultPolicy) -> Self {
        Self {
            delegate,
            trust_domain: trust_domain.into(),
            default_policy,
        }
    }

    /// Decides whether `source` may connect to `destination`.
    ///
    /// Intentions for the destination are considered in the order the
    /// delegate returns them; the first whose source side matches wins.
    pub async fn authorize(
        &self,
        source: &SpiffeIdService,
        destination: &SpiffeIdService,
    ) -> Result<Authorization> {
        if !source.host.eq_ignore_ascii_case(&self.trust_domain) {
            return Err(Error::TrustDomainMismatch {
                expected: self.trust_domain.clone(),
                actual: source.host.clone(),
            });
        }

        let (index, intentions) = self.delegate.read_intentions().await?;
        let applicable = intentions.iter().filter(|ixn| {
            authorize(
                &destination.service,
                &destination.namespace,
                &destination.partition,
                ixn,
                MatchType::Destination,
            )
            .matched
        });
        let decision = evaluate(
            applicable,
            source,
            MatchType::Source,
            self.default_policy.allows(),
        );
        debug!(
            source = %source.uri(),
            destination = %destination.uri(),
            allow = decision.allow,
            matched = decision.matched,
            index,
            "authorized connection"
        );
        Ok(decision)
    }

    /// Authorizes the client of a verified TLS connection.
    ///
    /// Only service identities may connect to services.
    pub async fn authorize_peer(
        &self,
        peer_certs: &[CertificateDer<'_>],
        destination: &SpiffeIdService,
    ) -> Result<Authorization> {
        let Some(leaf) = peer_certs.first() else {
            return Err(Error::Validation(
                "peer presented no certificate".to_string(),
            ));
        };
        match peer_identity(leaf.as_ref())? {
            SpiffeId::Service(source) => self.authorize(&source, destination).await,
            other => Err(Error::Validation(format!(
                "peer identity {other} is not a service"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intention::{Intention, IntentionAction, WILDCARD};
    use crate::state::InMemoryStateDelegate;

    const HOST: &str = "abc.mesh";

    fn svc(name: &str) -> SpiffeIdService {
        SpiffeIdService::new(HOST, "dc1", name)
    }

    fn authorizer(
        intentions: Vec<Intention>,
        policy: DefaultPolicy,
    ) -> (Arc<InMemoryStateDelegate>, ConnectAuthorizer<InMemoryStateDelegate>) {
        let delegate = Arc::new(InMemoryStateDelegate::new());
        delegate.set_intentions(intentions);
        let authorizer = ConnectAuthorizer::new(delegate.clone(), HOST, policy);
        (delegate, authorizer)
    }

    #[tokio::test]
    async fn test_default_policy_applies_without_intentions() {
        let (_, deny) = authorizer(vec![], DefaultPolicy::Deny);
        let auth = deny.authorize(&svc("web"), &svc("db")).await.unwrap();
        assert!(!auth.allow);
        assert!(!auth.matched);

        let (_, allow) = authorizer(vec![], DefaultPolicy::Allow);
        let auth = allow.authorize(&svc("web"), &svc("db")).await.unwrap();
        assert!(auth.allow);
        assert!(!auth.matched);
    }

    #[tokio::test]
    async fn test_first_matching_intention_wins() {
        let (_, authz) = authorizer(
            vec![
                Intention::new("web", "db", IntentionAction::Deny),
                Intention::new(WILDCARD, "db", IntentionAction::Allow),
            ],
            DefaultPolicy::Deny,
        );
        let web = authz.authorize(&svc("web"), &svc("db")).await.unwrap();
        assert!(web.matched && !web.allow);

        let api = authz.authorize(&svc("api"), &svc("db")).await.unwrap();
        assert!(api.matched && api.allow);
    }

    #[tokio::test]
    async fn test_intentions_for_other_destinations_ignored() {
        let (_, authz) = authorizer(
            vec![Intention::new("web", "cache", IntentionAction::Allow)],
            DefaultPolicy::Deny,
        );
        let auth = authz.authorize(&svc("web"), &svc("db")).await.unwrap();
        assert!(!auth.matched);
        assert!(!auth.allow);
    }

    #[tokio::test]
    async fn test_intention_updates_apply_immediately() {
        let (delegate, authz) = authorizer(vec![], DefaultPolicy::Deny);
        assert!(!authz.authorize(&svc("web"), &svc("db")).await.unwrap().allow);

        delegate.set_intentions(vec![Intention::new("web", "db", IntentionAction::Allow)]);
        assert!(authz.authorize(&svc("web"), &svc("db")).await.unwrap().allow);
    }

    #[tokio::test]
    async fn test_foreign_trust_domain_rejected() {
        let (_, authz) = authorizer(vec![], DefaultPolicy::Allow);
        let foreign = SpiffeIdService::new("other.mesh", "dc1", "web");
        assert!(matches!(
            authz.authorize(&foreign, &svc("db")).await,
            Err(Error::TrustDomainMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_unavailable_is_surfaced() {
        let (delegate, authz) = authorizer(vec![], DefaultPolicy::Allow);
        delegate.set_unavailable(true);
        let err = authz.authorize(&svc("web"), &svc("db")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_authorize_peer_requires_certificate() {
        let (_, authz) = authorizer(vec![], DefaultPolicy::Allow);
        assert!(matches!(
            authz.authorize_peer(&[], &svc("db")).await,
            Err(Error::Validation(_))
        ));
    }
}
