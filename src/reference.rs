//! The reference module keeps code -> display name pairs observed while
//! scraping (course codes today) and persists them between runs.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use log::debug;

use crate::constants::REFERENCE_KEY_PREFIX;
use crate::storage::KeyValueStore;

/// In-memory code -> name map for one namespace, dumped to and restored from a
/// `KeyValueStore` explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceCache {
    namespace: String,
    entries: HashMap<String, String>,
}

impl ReferenceCache {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            entries: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name for `code`, empty when unknown.
    pub fn get(&self, code: &str) -> &str {
        self.entries
            .get(code.trim())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Records an observation. A newer name for a known code replaces the old one.
    /// Pairs with an empty side are ignored.
    pub fn put(&mut self, code: &str, name: &str) {
        let (code, name) = (code.trim(), name.trim());
        if code.is_empty() || name.is_empty() {
            return;
        }
        if let Some(previous) = self.entries.insert(code.to_string(), name.to_string())
            && previous != name
        {
            debug!("Reference {code} renamed from {previous:?} to {name:?}");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by code.
    pub fn entries(&self) -> BTreeMap<&str, &str> {
        self.entries
            .iter()
            .map(|(code, name)| (code.as_str(), name.as_str()))
            .collect()
    }

    fn store_key(&self) -> String {
        format!("{REFERENCE_KEY_PREFIX}{}", self.namespace)
    }

    /// Restores persisted entries. Entries already in memory are newer
    /// observations and are kept over the stored ones.
    ///
    /// # Returns
    ///
    /// Returns the number of entries restored from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or holds invalid JSON.
    pub fn load_from_store(&mut self, store: &dyn KeyValueStore) -> Result<usize> {
        let key = self.store_key();
        let Some(json) = store.get(&[key.as_str()])?.remove(&key) else {
            return Ok(0);
        };
        let persisted: HashMap<String, String> = serde_json::from_str(&json)
            .with_context(|| format!("Corrupt reference cache {}", self.namespace))?;

        let mut restored = 0;
        for (code, name) in persisted {
            if !self.entries.contains_key(&code) {
                self.entries.insert(code, name);
                restored += 1;
            }
        }

        Ok(restored)
    }

    /// Dumps all entries to the store, replacing the previous dump.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_store(&self, store: &dyn KeyValueStore) -> Result<()> {
        let json = serde_json::to_string(&self.entries)?;
        store
            .set(&[(self.store_key().as_str(), json.as_str())])
            .with_context(|| format!("Unable to save reference cache {}", self.namespace))
    }
}
