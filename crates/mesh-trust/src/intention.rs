//! Intention matching.
//!
//! An intention is a directional allow/deny rule between a source and a
//! destination service. [`authorize`] decides whether a single intention
//! applies to a target for a given direction; [`evaluate`] walks an ordered
//! list and stops at the first intention that applies.

use crate::spiffe::{or_default, SpiffeIdService};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Namespace or name value matching anything.
pub const WILDCARD: &str = "*";

/// The decision an intention carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentionAction {
    Allow,
    #[default]
    Deny,
}

/// Which side of an intention a target is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Source,
    Destination,
    /// Any unrecognized value. Never matches.
    #[serde(other)]
    Unknown,
}

/// A directional rule from a source service to a destination service.
///
/// Empty partitions and namespaces mean the default tenant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Intention {
    pub source_partition: String,
    pub source_namespace: String,
    pub source_name: String,
    pub destination_partition: String,
    pub destination_namespace: String,
    pub destination_name: String,
    pub action: IntentionAction,
}

impl Intention {
    /// Creates an intention between two names in the default tenant.
    pub fn new(
        source_name: impl Into<String>,
        destination_name: impl Into<String>,
        action: IntentionAction,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            destination_name: destination_name.into(),
            action,
            ..Default::default()
        }
    }

    /// Creates an intention between two service identities.
    pub fn between(
        source: &SpiffeIdService,
        destination: &SpiffeIdService,
        action: IntentionAction,
    ) -> Self {
        Self {
            source_partition: source.partition.clone(),
            source_namespace: source.namespace.clone(),
            source_name: source.service.clone(),
            destination_partition: destination.partition.clone(),
            destination_namespace: destination.namespace.clone(),
            destination_name: destination.service.clone(),
            action,
        }
    }

    /// Checks the wildcard rules for this intention.
    ///
    /// A wildcard must be the whole value, and a wildcard namespace requires a
    /// wildcard name on the same side.
    pub fn validate(&self) -> Result<()> {
        for (side, ns, name) in [
            ("source", &self.source_namespace, &self.source_name),
            ("destination", &self.destination_namespace, &self.destination_name),
        ] {
            if name.is_empty() {
                return Err(Error::Validation(format!("{side} name must be set")));
            }
            for value in [ns, name] {
                if value.contains('*') && value != WILDCARD {
                    return Err(Error::Validation(format!(
                        "{side} value {value:?} uses a partial wildcard"
                    )));
                }
            }
            if ns == WILDCARD && name != WILDCARD {
                return Err(Error::Validation(format!(
                    "{side} wildcard namespace requires a wildcard name"
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of matching one intention.
///
/// `allow` is meaningless when `matched` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorization {
    pub allow: bool,
    pub matched: bool,
}

impl Authorization {
    const NO_MATCH: Authorization = Authorization {
        allow: false,
        matched: false,
    };
}

/// Decides whether `intention` applies to `target` on the `match_type` side.
pub fn authorize(
    target: &str,
    target_namespace: &str,
    target_partition: &str,
    intention: &Intention,
    match_type: MatchType,
) -> Authorization {
    let (partition, namespace, name) = match match_type {
        MatchType::Source => (
            &intention.source_partition,
            &intention.source_namespace,
            &intention.source_name,
        ),
        MatchType::Destination => (
            &intention.destination_partition,
            &intention.destination_namespace,
            &intention.destination_name,
        ),
        MatchType::Unknown => return Authorization::NO_MATCH,
    };

    if or_default(partition) != or_default(target_partition) {
        return Authorization::NO_MATCH;
    }
    if namespace != WILDCARD && or_default(namespace) != or_default(target_namespace) {
        return Authorization::NO_MATCH;
    }
    if name != WILDCARD && name != target {
        return Authorization::NO_MATCH;
    }

    Authorization {
        allow: intention.action == IntentionAction::Allow,
        matched: true,
    }
}

/// Evaluates intentions in the given order and returns the first match.
///
/// Precedence is the caller's responsibility. When nothing matches the
/// result carries `default_allow` with `matched` set to false.
pub fn evaluate<'a, I>(
    intentions: I,
    target: &SpiffeIdService,
    match_type: MatchType,
    default_allow: bool,
) -> Authorization
where
    I: IntoIterator<Item = &'a Intention>,
{
    intentions
        .into_iter()
        .map(|ixn| {
            authorize(
                &target.service,
                &target.namespace,
                &target.partition,
                ixn,
                match_type,
            )
        })
        .find(|auth| auth.matched)
        .unwrap_or(Authorization {
            allow: default_allow,
            matched: false,
        })
}
