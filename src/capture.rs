//! The capture module ties one extraction run to persistence: run the plan,
//! merge the records into the stored snapshot, save, and report a status the
//! caller can tell apart.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::{info, warn};

use crate::DatasetKind;
use crate::config::{ExtractionPlan, PortalConfig};
use crate::fetch::XmlSource;
use crate::merge::{MergeOutcome, merge};
use crate::notify::{Notification, Notifier};
use crate::reference::ReferenceCache;
use crate::scrape::{BatchSettings, CancelToken, Orchestrator, RowError, Selection};
use crate::snapshot::{SavedSnapshot, SnapshotStore};
use crate::storage::KeyValueStore;
use crate::table::Dataset;
use crate::view::{Filter, load_view, strip_derived};

/// Reference cache namespace for course codes.
pub const COURSE_NAMESPACE: &str = "course";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Every row captured cleanly and the merged snapshot is stored
    Saved,
    /// Stored, but some rows have blank fields
    SavedWithRowErrors,
    /// Records were captured but the snapshot was not written
    NotSaved,
    /// Nothing was captured
    Failed,
}

/// Merge bookkeeping surfaced to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub records: usize,
    pub replaced: usize,
    pub kept: usize,
    pub dropped_unkeyed: usize,
}

impl From<&MergeOutcome> for MergeSummary {
    fn from(outcome: &MergeOutcome) -> Self {
        Self {
            records: outcome.dataset.len(),
            replaced: outcome.replaced,
            kept: outcome.kept,
            dropped_unkeyed: outcome.dropped_unkeyed,
        }
    }
}

/// Final result of `Harvester::capture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub kind: DatasetKind,
    pub status: CaptureStatus,
    /// Run was cancelled before every row was enriched
    pub partial: bool,
    pub captured: usize,
    pub total_rows: usize,
    pub row_errors: Vec<RowError>,
    pub merge: Option<MergeSummary>,
    pub saved: Option<SavedSnapshot>,
    /// Why the capture failed or was not saved
    pub failure: Option<String>,
}

impl CaptureReport {
    fn failed(kind: DatasetKind, reason: String) -> Self {
        Self {
            kind,
            status: CaptureStatus::Failed,
            partial: false,
            captured: 0,
            total_rows: 0,
            row_errors: Vec::new(),
            merge: None,
            saved: None,
            failure: Some(reason),
        }
    }

    /// One-line status message for the user.
    pub fn summary(&self) -> String {
        let kind = self.kind;
        let mut line = match self.status {
            CaptureStatus::Saved => format!("Captured and saved {} {kind}", self.captured),
            CaptureStatus::SavedWithRowErrors => format!(
                "Captured and saved {} {kind} with {} row errors",
                self.captured,
                self.row_errors.len()
            ),
            CaptureStatus::NotSaved => format!(
                "Captured {} {kind} but NOT saved: {}",
                self.captured,
                self.failure.as_deref().unwrap_or("unknown error")
            ),
            CaptureStatus::Failed => format!(
                "Capture of {kind} failed: {}",
                self.failure.as_deref().unwrap_or("unknown error")
            ),
        };
        if let Some(merge) = &self.merge {
            line.push_str(&format!(
                "; stored dataset has {} records ({} kept from earlier captures)",
                merge.records, merge.kept
            ));
            if merge.dropped_unkeyed > 0 {
                line.push_str(&format!(
                    ", {} records without key dropped",
                    merge.dropped_unkeyed
                ));
            }
        }
        if self.partial {
            line.push_str(&format!(
                " [partial: cancelled after {} of {} rows]",
                self.captured, self.total_rows
            ));
        }
        line
    }
}

/// Owns the collaborators of a capture: orchestrator, stores and notifier.
pub struct Harvester {
    config: PortalConfig,
    orchestrator: Orchestrator,
    snapshots: SnapshotStore,
    store: Arc<dyn KeyValueStore>,
    cache: Arc<Mutex<ReferenceCache>>,
    notifier: Arc<dyn Notifier>,
}

impl Harvester {
    /// Wires a harvester and restores the persisted reference cache.
    ///
    /// # Arguments
    ///
    /// * `config` - Portal descriptor
    /// * `source` - Where XML fragments come from
    /// * `store` - Key-value persistence for snapshots and the reference cache
    /// * `notifier` - Progress channel; may discard everything
    pub fn new(
        config: PortalConfig,
        source: Arc<dyn XmlSource>,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let mut cache = ReferenceCache::new(COURSE_NAMESPACE);
        match cache.load_from_store(store.as_ref()) {
            Ok(restored) => info!("Restored {restored} reference entries"),
            Err(err) => warn!("Starting with an empty reference cache: {err:#}"),
        }
        let cache = Arc::new(Mutex::new(cache));

        let orchestrator = Orchestrator::new(
            source,
            Arc::clone(&cache),
            BatchSettings::from_config(&config),
        )
        .with_period_lookup(config.period.clone(), &config.default_period);

        Self {
            orchestrator,
            snapshots: SnapshotStore::new(Arc::clone(&store)),
            store,
            cache,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn cache(&self) -> Arc<Mutex<ReferenceCache>> {
        Arc::clone(&self.cache)
    }

    /// Captures `kind` for `selection`, merges it into the stored snapshot and
    /// saves the result. Never returns an error: every outcome is a status.
    pub async fn capture(
        &self,
        kind: DatasetKind,
        selection: &Selection,
        cancel: &CancelToken,
    ) -> CaptureReport {
        let plan = self.config.plan(kind);
        self.notifier
            .notify(Notification::message(format!("Capturing {kind}...")));

        let notifier = Arc::clone(&self.notifier);
        let outcome = match self
            .orchestrator
            .run(plan, selection, cancel, |progress| {
                notifier.notify(Notification::progress(
                    format!("Enriched {}/{} rows", progress.processed, progress.total),
                    progress.processed,
                    progress.total,
                ));
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let report = CaptureReport::failed(kind, err.to_string());
                self.notifier.notify(Notification::message(report.summary()));
                return report;
            }
        };

        if outcome.records.is_empty() {
            let report = CaptureReport::failed(
                kind,
                "cancelled before any record was captured".to_string(),
            );
            self.notifier.notify(Notification::message(report.summary()));
            return report;
        }

        let mut report = CaptureReport {
            kind,
            status: CaptureStatus::Saved,
            partial: outcome.is_partial(),
            captured: outcome.records.len(),
            total_rows: outcome.total_rows,
            row_errors: outcome.errors.clone(),
            merge: None,
            saved: None,
            failure: None,
        };

        let mut fresh = outcome.to_dataset();
        strip_derived(&mut fresh, &plan.derived);
        match self.persist(kind, plan, &fresh) {
            Ok((merged, saved)) => {
                report.merge = Some(MergeSummary::from(&merged));
                report.saved = Some(saved);
                if !report.row_errors.is_empty() {
                    report.status = CaptureStatus::SavedWithRowErrors;
                }
            }
            Err(err) => {
                report.status = CaptureStatus::NotSaved;
                report.failure = Some(format!("{err:#}"));
            }
        }

        if let Err(err) = self.save_cache() {
            warn!("Reference cache not saved: {err:#}");
        }

        self.notifier.notify(Notification::message(report.summary()));
        report
    }

    fn persist(
        &self,
        kind: DatasetKind,
        plan: &ExtractionPlan,
        fresh: &Dataset,
    ) -> Result<(MergeOutcome, SavedSnapshot)> {
        let stored = match self.snapshots.read(kind)? {
            Some(snapshot) => {
                let mut stored = Dataset::from_blob(&snapshot.blob)
                    .context("Stored snapshot is unreadable; refusing to overwrite it")?;
                strip_derived(&mut stored, &plan.derived);
                Some(stored)
            }
            None => None,
        };

        let merged = merge(stored.as_ref(), fresh, &plan.key_candidates)?;
        if merged.dropped_unkeyed > 0 {
            warn!(
                "Dropped {} {kind} records without {}",
                merged.dropped_unkeyed, merged.key_column
            );
        }

        let blob = merged.dataset.to_blob()?;
        let saved = self.snapshots.write(kind, &blob, Utc::now())?;
        Ok((merged, saved))
    }

    /// Persists the reference cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is poisoned or the store write fails.
    pub fn save_cache(&self) -> Result<()> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("Reference cache mutex poisoned"))?;
        cache.save_to_store(self.store.as_ref())
    }

    /// Stored dataset with derived columns, filtered and sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read or parsed.
    pub fn view(
        &self,
        kind: DatasetKind,
        filters: &[Filter],
        sort_by: Option<&str>,
    ) -> Result<Dataset> {
        load_view(
            &self.snapshots,
            kind,
            &self.config.plan(kind).derived,
            filters,
            sort_by,
        )
    }

    /// Clears the stored dataset of `kind`. The reference cache is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn clear(&self, kind: DatasetKind) -> Result<()> {
        self.snapshots.clear(kind)?;
        self.notifier
            .notify(Notification::message(format!("Cleared stored {kind}")));
        Ok(())
    }
}
