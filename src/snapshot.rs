//! The snapshot module keeps the current merged dataset of each kind as a
//! serialized blob plus its capture timestamp.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use log::debug;

use crate::DatasetKind;
use crate::constants::SNAPSHOT_KEY_PREFIX;
use crate::storage::KeyValueStore;

/// Stored content of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub blob: String,
    pub captured_at: DateTime<Utc>,
}

/// Confirmation that a write landed and reads back intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSnapshot {
    pub kind: DatasetKind,
    pub bytes: usize,
    pub captured_at: DateTime<Utc>,
}

/// Two independent slots (offerings, students) over a `KeyValueStore`.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn KeyValueStore>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn keys(kind: DatasetKind) -> (String, String) {
        (
            format!("{SNAPSHOT_KEY_PREFIX}{}.blob", kind.as_str()),
            format!("{SNAPSHOT_KEY_PREFIX}{}.captured_at", kind.as_str()),
        )
    }

    /// Reads the slot for `kind`.
    ///
    /// # Returns
    ///
    /// Returns `None` when the slot has never been written or was cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the timestamp is corrupt.
    pub fn read(&self, kind: DatasetKind) -> Result<Option<Snapshot>> {
        let (blob_key, time_key) = Self::keys(kind);
        let mut values = self.store.get(&[blob_key.as_str(), time_key.as_str()])?;

        let Some(blob) = values.remove(&blob_key) else {
            return Ok(None);
        };
        let captured_at = match values.remove(&time_key) {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("Corrupt capture timestamp for {kind}: {raw}"))?
                .with_timezone(&Utc),
            None => DateTime::<Utc>::default(),
        };

        Ok(Some(Snapshot { blob, captured_at }))
    }

    /// Replaces the slot for `kind` and confirms the write by reading it back.
    ///
    /// Blob and timestamp are written in one atomic `set`, so a concurrent
    /// reader sees either the old pair or the new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the read-back does not match.
    pub fn write(
        &self,
        kind: DatasetKind,
        blob: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<SavedSnapshot> {
        let (blob_key, time_key) = Self::keys(kind);
        let timestamp = captured_at.to_rfc3339();
        self.store
            .set(&[(blob_key.as_str(), blob), (time_key.as_str(), timestamp.as_str())])
            .with_context(|| format!("Unable to save {kind} snapshot"))?;

        let stored = self
            .store
            .get(&[blob_key.as_str()])
            .with_context(|| format!("Unable to confirm {kind} snapshot"))?;
        if stored.get(&blob_key).map(String::as_str) != Some(blob) {
            bail!("{kind} snapshot did not read back as written");
        }

        debug!("Saved {kind} snapshot: {} bytes", blob.len());
        Ok(SavedSnapshot {
            kind,
            bytes: blob.len(),
            captured_at,
        })
    }

    /// Empties the slot for `kind`. The other slot is untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn clear(&self, kind: DatasetKind) -> Result<()> {
        let (blob_key, time_key) = Self::keys(kind);
        self.store
            .remove(&[blob_key.as_str(), time_key.as_str()])
            .with_context(|| format!("Unable to clear {kind} snapshot"))
    }
}
