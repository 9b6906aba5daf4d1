//! CA provider configuration.
//!
//! Operators hand the provider a loosely typed key/value map. Keys are
//! normalized through a fixed alias table (`LeafCertTTL`, `leaf_cert_ttl` and
//! `leafcertttl` are the same key), then deserialized into
//! [`BuiltinProviderConfig`] and checked by [`BuiltinProviderConfig::validate`].
//!
//! Durations accept Go-style strings such as `"72h"` or `"1h30m"`, or an
//! integer number of seconds.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

pub const DEFAULT_LEAF_CERT_TTL: Duration = Duration::from_secs(72 * 3600);
pub const DEFAULT_INTERMEDIATE_CERT_TTL: Duration = Duration::from_secs(8760 * 3600);
pub const DEFAULT_ROOT_CERT_TTL: Duration = Duration::from_secs(87600 * 3600);
pub const MIN_LEAF_CERT_TTL: Duration = HOUR;
pub const MAX_LEAF_CERT_TTL: Duration = Duration::from_secs(365 * 24 * 3600);
/// Intermediates are checked for renewal on this interval.
pub const INTERMEDIATE_RENEW_INTERVAL: Duration = HOUR;
pub const DEFAULT_CSR_MAX_PER_SECOND: f64 = 50.0;

/// Accepted spellings (lowercased, separators removed) and their canonical key.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("leafcertttl", "leaf_cert_ttl"),
    ("intermediatecertttl", "intermediate_cert_ttl"),
    ("rootcertttl", "root_cert_ttl"),
    ("privatekeytype", "private_key_type"),
    ("privatekeybits", "private_key_bits"),
    ("privatekey", "private_key"),
    ("rootcert", "root_cert"),
    ("skipvalidate", "skip_validate"),
    ("csrmaxpersecond", "csr_max_per_second"),
    ("csrmaxconcurrent", "csr_max_concurrent"),
    ("disablecrosssigning", "disable_cross_signing"),
];

/// Input to [`Provider::configure`](crate::ca::Provider::configure).
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    /// Cluster identifier; becomes the first label of the trust domain.
    pub cluster_id: String,
    /// Whether this provider serves the primary datacenter.
    pub is_primary: bool,
    /// Provider-specific settings.
    pub raw_config: Map<String, Value>,
}

impl ProviderConfig {
    pub fn new(cluster_id: impl Into<String>, is_primary: bool) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            is_primary,
            raw_config: Map::new(),
        }
    }

    /// Adds one raw setting.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw_config.insert(key.into(), value.into());
        self
    }
}

/// Private key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ec,
    Rsa,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ec => f.write_str("ec"),
            KeyType::Rsa => f.write_str("rsa"),
        }
    }
}

/// Settings of the built-in provider, including those shared by all providers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuiltinProviderConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub leaf_cert_ttl: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub intermediate_cert_ttl: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub root_cert_ttl: Duration,
    pub private_key_type: KeyType,
    pub private_key_bits: u32,
    /// Operator-supplied signing key (PKCS#8 PEM).
    pub private_key: Option<String>,
    /// Operator-supplied root certificate; requires `private_key`.
    pub root_cert: Option<String>,
    pub skip_validate: bool,
    pub csr_max_per_second: f64,
    pub csr_max_concurrent: u32,
    pub disable_cross_signing: bool,
}

impl Default for BuiltinProviderConfig {
    fn default() -> Self {
        Self {
            leaf_cert_ttl: DEFAULT_LEAF_CERT_TTL,
            intermediate_cert_ttl: DEFAULT_INTERMEDIATE_CERT_TTL,
            root_cert_ttl: DEFAULT_ROOT_CERT_TTL,
            private_key_type: KeyType::Ec,
            private_key_bits: 256,
            private_key: None,
            root_cert: None,
            skip_validate: false,
            csr_max_per_second: DEFAULT_CSR_MAX_PER_SECOND,
            csr_max_concurrent: 0,
            disable_cross_signing: false,
        }
    }
}

impl BuiltinProviderConfig {
    /// Decodes and validates a raw configuration map.
    pub fn from_raw(raw: &Map<String, Value>) -> Result<Self> {
        let normalized = normalize_keys(raw)?;
        let config: Self = serde_json::from_value(Value::Object(normalized))
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks TTL relationships and key parameters.
    ///
    /// `skip_validate` bypasses the TTL and key checks but not the
    /// requirement that a supplied root certificate comes with its key.
    pub fn validate(&self) -> Result<()> {
        if self.root_cert.is_some() && self.private_key.is_none() {
            return Err(Error::Config(
                "root_cert requires private_key to be set".to_string(),
            ));
        }
        if self.skip_validate {
            return Ok(());
        }

        if self.root_cert_ttl < self.intermediate_cert_ttl {
            return Err(Error::Config(format!(
                "root cert TTL ({}) must not be less than intermediate cert TTL ({})",
                fmt_duration(self.root_cert_ttl),
                fmt_duration(self.intermediate_cert_ttl)
            )));
        }
        if self.leaf_cert_ttl < MIN_LEAF_CERT_TTL {
            return Err(Error::Config(format!(
                "leaf cert TTL must be at least {}",
                fmt_duration(MIN_LEAF_CERT_TTL)
            )));
        }
        if self.leaf_cert_ttl > MAX_LEAF_CERT_TTL {
            return Err(Error::Config(format!(
                "leaf cert TTL must be at most {}",
                fmt_duration(MAX_LEAF_CERT_TTL)
            )));
        }
        if self.intermediate_cert_ttl < 3 * INTERMEDIATE_RENEW_INTERVAL {
            return Err(Error::Config(format!(
                "intermediate cert TTL must be at least {}",
                fmt_duration(3 * INTERMEDIATE_RENEW_INTERVAL)
            )));
        }
        if self.intermediate_cert_ttl < 3 * self.leaf_cert_ttl {
            return Err(Error::Config(format!(
                "intermediate cert TTL must be at least 3 * leaf cert TTL ({})",
                fmt_duration(3 * self.leaf_cert_ttl)
            )));
        }

        match self.private_key_type {
            KeyType::Ec if ![256, 384].contains(&self.private_key_bits) => {
                return Err(Error::Config(
                    "EC key length must be 256 or 384 bits".to_string(),
                ));
            }
            KeyType::Rsa if ![2048, 4096].contains(&self.private_key_bits) => {
                return Err(Error::Config(
                    "RSA key length must be 2048 or 4096 bits".to_string(),
                ));
            }
            _ => {}
        }

        if self.csr_max_per_second.is_nan() || self.csr_max_per_second < 0.0 {
            return Err(Error::Config(
                "csr_max_per_second must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn normalize_keys(raw: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in raw {
        let folded: String = key
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let canonical = KEY_ALIASES
            .iter()
            .find(|(alias, _)| *alias == folded)
            .map(|(_, canonical)| *canonical)
            .ok_or_else(|| Error::Config(format!("unknown configuration key: {key}")))?;
        if out.insert(canonical.to_string(), value.clone()).is_some() {
            return Err(Error::Config(format!(
                "configuration key {canonical} given more than once"
            )));
        }
    }
    Ok(out)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => humantime::parse_duration(text.trim())
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {text:?}: {e}"))),
    }
}

fn fmt_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}
