//! Persisted provider state and the delegate that stores it.
//!
//! The built-in provider never keeps signing material only in memory: every
//! change goes through [`StateDelegate::apply_provider_state_write`], and
//! every signing operation starts by reading the latest applied state. The
//! delegate is expected to be linearizable; its index increases on every
//! write.

use crate::intention::Intention;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Durable state of one built-in provider instance.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderState {
    /// Derived from the provider's configured key material; see
    /// [`BuiltinProvider`](crate::ca::BuiltinProvider).
    pub id: String,
    pub private_key: String,
    /// Key generated for an intermediate CSR that has not been installed yet.
    #[serde(default)]
    pub pending_private_key: String,
    pub root_cert: String,
    pub intermediate_cert: String,
    /// Last serial number handed out by this provider.
    pub last_serial: u64,
}

impl std::fmt::Debug for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderState")
            .field("id", &self.id)
            .field(
                "private_key",
                &if self.private_key.is_empty() {
                    ""
                } else {
                    "[REDACTED]"
                },
            )
            .field(
                "pending_private_key",
                &if self.pending_private_key.is_empty() {
                    ""
                } else {
                    "[REDACTED]"
                },
            )
            .field("has_root_cert", &!self.root_cert.is_empty())
            .field("has_intermediate_cert", &!self.intermediate_cert.is_empty())
            .field("last_serial", &self.last_serial)
            .finish()
    }
}

/// Access to the replicated state store.
#[async_trait]
pub trait StateDelegate: Send + Sync {
    /// Reads a provider's state and the index at which it was last written.
    async fn read_provider_state(&self, id: &str) -> Result<Option<(u64, ProviderState)>>;

    /// Writes a provider's state, returning the index of the write.
    async fn apply_provider_state_write(&self, state: ProviderState) -> Result<u64>;

    /// Deletes a provider's state, returning the index of the delete.
    async fn apply_provider_state_delete(&self, id: &str) -> Result<u64>;

    /// Reads all intentions and the index they were read at.
    async fn read_intentions(&self) -> Result<(u64, Vec<Intention>)>;
}

#[derive(Default)]
struct Store {
    index: u64,
    providers: HashMap<String, (u64, ProviderState)>,
    intentions: (u64, Vec<Intention>),
}

/// In-process [`StateDelegate`].
///
/// Writes are applied under one lock, so reads always observe the latest
/// write. [`set_unavailable`](Self::set_unavailable) makes every call fail
/// with [`Error::BackendUnavailable`].
#[derive(Default)]
pub struct InMemoryStateDelegate {
    store: Mutex<Store>,
    unavailable: AtomicBool,
}

impl InMemoryStateDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the intention list.
    pub fn set_intentions(&self, intentions: Vec<Intention>) -> u64 {
        let mut store = self.store.lock();
        store.index += 1;
        store.intentions = (store.index, intentions);
        store.index
    }

    /// Toggles simulated backend failure.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the index of the latest write.
    pub fn index(&self) -> u64 {
        self.store.lock().index
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable(
                "state store is unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StateDelegate for InMemoryStateDelegate {
    async fn read_provider_state(&self, id: &str) -> Result<Option<(u64, ProviderState)>> {
        self.check_available()?;
        Ok(self.store.lock().providers.get(id).cloned())
    }

    async fn apply_provider_state_write(&self, state: ProviderState) -> Result<u64> {
        self.check_available()?;
        if state.id.is_empty() {
            return Err(Error::Validation("provider state has no ID".to_string()));
        }
        let mut store = self.store.lock();
        store.index += 1;
        let index = store.index;
        store.providers.insert(state.id.clone(), (index, state));
        Ok(index)
    }

    async fn apply_provider_state_delete(&self, id: &str) -> Result<u64> {
        self.check_available()?;
        let mut store = self.store.lock();
        store.index += 1;
        store.providers.remove(id);
        Ok(store.index)
    }

    async fn read_intentions(&self) -> Result<(u64, Vec<Intention>)> {
        self.check_available()?;
        Ok(self.store.lock().intentions.clone())
    }
}
