//! The rosterharvest library captures course offerings and student rosters
//! from an academic portal's XML endpoints, merges them into stored snapshots
//! keyed by record id, and serves them back as filtered tables.

pub mod capture;
pub mod config;
pub mod constants;
pub mod fetch;
pub mod merge;
pub mod notify;
pub mod parse;
pub mod reference;
pub mod scrape;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod transform;
pub mod view;
pub mod xml;

/// Enum representing the kind of dataset being captured.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DatasetKind {
    /// Course offerings with schedule, professors and courses
    Offerings,
    /// Student roster with enrolled disciplines
    Students,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Offerings, DatasetKind::Students];

    pub fn as_str(self) -> &'static str {
        match self {
            DatasetKind::Offerings => "offerings",
            DatasetKind::Students => "students",
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl std::str::FromStr for DatasetKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_lowercase().as_str() {
            "offerings" => Ok(DatasetKind::Offerings),
            "students" => Ok(DatasetKind::Students),
            _ => Err(format!("Invalid dataset kind: {}", input)),
        }
    }
}

pub use capture::{CaptureReport, CaptureStatus, Harvester};
pub use config::PortalConfig;
pub use fetch::{FetchError, PortalClient, XmlSource};
pub use merge::{MergeError, MergeOutcome, merge};
pub use scrape::{CancelToken, Orchestrator, RunOutcome, Selection};
pub use snapshot::SnapshotStore;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use table::{Dataset, Record};
