//! Collection registry
//!
//! Each logical collection (expenses, tasks, notes, ...) is an independent
//! [`DocumentStore`] with its own database file. `Collections` opens the
//! configured set once and hands out shared handles.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::storage::{StoreError, StoreResult};
use crate::store::DocumentStore;

/// The open collections of one data directory
pub struct Collections {
    stores: BTreeMap<String, Arc<DocumentStore>>,
}

impl Collections {
    /// Open every collection named in the config
    pub fn open(config: &Config) -> StoreResult<Self> {
        let mut stores = BTreeMap::new();
        for name in &config.collections {
            let store = DocumentStore::open(config, name)?;
            debug!(collection = %name, "opened collection");
            stores.insert(name.clone(), Arc::new(store));
        }
        Ok(Self { stores })
    }

    /// Open in-memory collections (for testing)
    pub fn open_in_memory(names: &[&str]) -> StoreResult<Self> {
        let mut stores = BTreeMap::new();
        for name in names {
            stores.insert(
                name.to_string(),
                Arc::new(DocumentStore::open_in_memory(name)?),
            );
        }
        Ok(Self { stores })
    }

    /// Get a collection by name
    pub fn get(&self, name: &str) -> StoreResult<Arc<DocumentStore>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                id: format!("collection {}", name),
            })
    }

    /// Collection names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(|s| s.as_str())
    }

    /// All collections in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<DocumentStore>)> {
        self.stores.iter().map(|(name, store)| (name.as_str(), store))
    }
}
