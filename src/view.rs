//! The view module loads a stored dataset for consumers: derived columns are
//! recomputed, then filters and sorting are applied.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::DatasetKind;
use crate::snapshot::SnapshotStore;
use crate::table::{Dataset, Record, field};

/// A computed column. Pure function of other columns; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedColumn {
    /// Enrolled over capacity as a whole percentage, e.g. `"88%"`
    Occupancy {
        column: String,
        enrolled: String,
        capacity: String,
    },
    /// `"<year>/<term>"`
    Period {
        column: String,
        year: String,
        term: String,
    },
    /// `"Ativo"` when `source` is one of `active`, otherwise `"Inativo"`
    Status {
        column: String,
        source: String,
        active: Vec<String>,
    },
}

impl DerivedColumn {
    pub fn column(&self) -> &str {
        match self {
            DerivedColumn::Occupancy { column, .. }
            | DerivedColumn::Period { column, .. }
            | DerivedColumn::Status { column, .. } => column,
        }
    }

    pub fn compute(&self, record: &Record) -> String {
        match self {
            DerivedColumn::Occupancy {
                enrolled, capacity, ..
            } => occupancy(field(record, enrolled), field(record, capacity)),
            DerivedColumn::Period { year, term, .. } => {
                let (year, term) = (field(record, year), field(record, term));
                if year.is_empty() || term.is_empty() {
                    String::new()
                } else {
                    format!("{year}/{term}")
                }
            }
            DerivedColumn::Status { source, active, .. } => {
                let value = field(record, source).trim();
                if value.is_empty() {
                    String::new()
                } else if active.iter().any(|a| a.eq_ignore_ascii_case(value)) {
                    "Ativo".to_string()
                } else {
                    "Inativo".to_string()
                }
            }
        }
    }
}

fn occupancy(enrolled: &str, capacity: &str) -> String {
    match (enrolled.trim().parse::<f64>(), capacity.trim().parse::<f64>()) {
        (Ok(enrolled), Ok(capacity)) if capacity > 0.0 => {
            format!("{:.0}%", (enrolled / capacity * 100.0).round())
        }
        _ => String::new(),
    }
}

/// Appends (or recomputes) every derived column.
pub fn apply_derived(dataset: &mut Dataset, derived: &[DerivedColumn]) {
    for column in derived {
        if !dataset.headers.iter().any(|h| h == column.column()) {
            dataset.headers.push(column.column().to_string());
        }
        for record in &mut dataset.records {
            let value = column.compute(record);
            record.insert(column.column().to_string(), value);
        }
    }
}

/// Removes derived columns so they are never stored as source data.
pub fn strip_derived(dataset: &mut Dataset, derived: &[DerivedColumn]) {
    for column in derived {
        dataset.headers.retain(|h| h != column.column());
        for record in &mut dataset.records {
            record.remove(column.column());
        }
    }
}

/// Case-insensitive substring match on one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl std::str::FromStr for Filter {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split_once('=') {
            Some((column, value)) if !column.trim().is_empty() => Ok(Filter {
                column: column.trim().to_string(),
                value: value.trim().to_string(),
            }),
            _ => Err(format!("Invalid filter, expected column=value: {input}")),
        }
    }
}

impl Filter {
    pub fn matches(&self, record: &Record) -> bool {
        field(record, &self.column)
            .to_lowercase()
            .contains(&self.value.to_lowercase())
    }
}

/// Stored dataset of `kind`, derived columns added, filtered and sorted.
///
/// # Arguments
///
/// * `snapshots` - Store to read from
/// * `kind` - Which dataset
/// * `derived` - Computed columns to add
/// * `filters` - All must match for a record to be kept
/// * `sort_by` - Optional column to sort on (stable, case-insensitive)
///
/// # Returns
///
/// Returns an empty dataset when nothing has been captured yet.
///
/// # Errors
///
/// Returns an error if the snapshot cannot be read or parsed.
pub fn load_view(
    snapshots: &SnapshotStore,
    kind: DatasetKind,
    derived: &[DerivedColumn],
    filters: &[Filter],
    sort_by: Option<&str>,
) -> Result<Dataset> {
    let mut dataset = match snapshots.read(kind)? {
        Some(snapshot) => Dataset::from_blob(&snapshot.blob)?,
        None => return Ok(Dataset::default()),
    };

    apply_derived(&mut dataset, derived);
    dataset
        .records
        .retain(|record| filters.iter().all(|filter| filter.matches(record)));
    if let Some(column) = sort_by {
        dataset
            .records
            .sort_by_key(|record| field(record, column).to_lowercase());
    }

    Ok(dataset)
}
