//! Registry of backend metadata store configurations
//!
//! Stores are registered under readable IDs such as `meta-test1`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{MasterError, Result};

/// Connection settings for one backend store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub store_id: String,
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
}

/// Manages backend store configs keyed by store ID
#[derive(Default)]
pub struct MetaStoreManager {
    stores: DashMap<String, StoreConfig>,
}

impl MetaStoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store` under `id`; a duplicate ID is an error
    pub fn register(&self, id: &str, store: StoreConfig) -> Result<()> {
        match self.stores.entry(id.to_string()) {
            Entry::Occupied(_) => {
                error!(
                    store_id = id,
                    endpoints = ?store.endpoints,
                    "Register metastore failed, duplicate store ID"
                );
                Err(MasterError::MetaStoreIdDuplicate { id: id.into() })
            }
            Entry::Vacant(slot) => {
                slot.insert(store);
                info!(store_id = id, "Registered metastore");
                Ok(())
            }
        }
    }

    /// Remove the store registered under `id`, if any
    pub fn unregister(&self, id: &str) {
        self.stores.remove(id);
        info!(store_id = id, "Unregistered metastore");
    }

    /// Config registered under `id`
    pub fn get(&self, id: &str) -> Option<StoreConfig> {
        self.stores.get(id).map(|entry| entry.value().clone())
    }
}
