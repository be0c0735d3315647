//! The merge module reconciles a fresh capture with the stored snapshot on a
//! natural key. Fresh records win, unrelated stored records survive, and
//! records without a key are dropped.

use std::collections::HashMap;

use log::{debug, warn};
use thiserror::Error;

use crate::table::{Dataset, Record, field};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("None of the key columns {0:?} is present in the captured header")]
    NoKeyColumn(Vec<String>),
}

/// Merged dataset plus the bookkeeping a caller reports to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    /// Header name the merge keyed on
    pub key_column: String,
    /// Records from either side whose key was empty
    pub dropped_unkeyed: usize,
    /// Stored records superseded by a fresh one
    pub replaced: usize,
    /// Stored records carried over untouched
    pub kept: usize,
    /// Fresh records whose key repeated an earlier fresh record
    pub duplicates_in_capture: usize,
}

/// Case, space, dash and underscore insensitive form of a column name, so that
/// `"ID Oferta"`, `"Id Oferta"` and `"idOferta"` compare equal.
pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// First candidate found in `headers`, returned as spelled in `headers`.
/// Exact spellings are preferred over normalized matches.
pub fn resolve_key_column(headers: &[String], candidates: &[String]) -> Option<String> {
    candidates.iter().find_map(|candidate| {
        headers
            .iter()
            .find(|header| *header == candidate)
            .or_else(|| {
                let wanted = normalize_column_name(candidate);
                headers
                    .iter()
                    .find(|header| normalize_column_name(header) == wanted)
            })
            .cloned()
    })
}

/// Merges `fresh` into `stored`.
///
/// The merged header is the fresh header. Stored records are reprojected onto
/// it, blank where they lack a column. Output holds fresh records in capture
/// order followed by the surviving stored records in stored order.
///
/// # Arguments
///
/// * `stored` - Previously persisted dataset, if any
/// * `fresh` - Dataset from the capture that just finished
/// * `key_candidates` - Natural key column names, preferred first
///
/// # Errors
///
/// Returns `MergeError::NoKeyColumn` if no candidate matches the fresh header.
pub fn merge(
    stored: Option<&Dataset>,
    fresh: &Dataset,
    key_candidates: &[String],
) -> Result<MergeOutcome, MergeError> {
    let key_column = resolve_key_column(&fresh.headers, key_candidates)
        .ok_or_else(|| MergeError::NoKeyColumn(key_candidates.to_vec()))?;

    let mut outcome = MergeOutcome {
        dataset: Dataset::new(fresh.headers.clone()),
        key_column: key_column.clone(),
        ..MergeOutcome::default()
    };
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in &fresh.records {
        let key = field(record, &key_column).trim().to_string();
        if key.is_empty() {
            outcome.dropped_unkeyed += 1;
            continue;
        }
        let projected = outcome.dataset.project(record);
        if let Some(&at) = positions.get(&key) {
            if let Some(slot) = outcome.dataset.records.get_mut(at) {
                *slot = projected;
            }
            outcome.duplicates_in_capture += 1;
        } else {
            positions.insert(key, outcome.dataset.records.len());
            outcome.dataset.records.push(projected);
        }
    }

    if let Some(stored) = stored {
        carry_over(stored, key_candidates, &key_column, &mut positions, &mut outcome);
    }

    debug!(
        "Merged on {key_column}: {} records, {} replaced, {} kept, {} dropped without key",
        outcome.dataset.len(),
        outcome.replaced,
        outcome.kept,
        outcome.dropped_unkeyed
    );
    Ok(outcome)
}

fn carry_over(
    stored: &Dataset,
    key_candidates: &[String],
    key_column: &str,
    positions: &mut HashMap<String, usize>,
    outcome: &mut MergeOutcome,
) {
    let mut candidates = vec![key_column.to_string()];
    candidates.extend(key_candidates.iter().cloned());
    let Some(stored_key) = resolve_key_column(&stored.headers, &candidates) else {
        warn!(
            "Stored snapshot has no key column among {candidates:?}; dropping its {} records",
            stored.len()
        );
        outcome.dropped_unkeyed += stored.len();
        return;
    };

    let headers = outcome.dataset.headers.clone();
    let column_map = map_columns(&headers, &stored.headers, key_column, &stored_key);

    for record in &stored.records {
        let key = field(record, &stored_key).trim().to_string();
        if key.is_empty() {
            outcome.dropped_unkeyed += 1;
            continue;
        }
        if positions.contains_key(&key) {
            outcome.replaced += 1;
            continue;
        }

        let reprojected: Record = column_map
            .iter()
            .map(|&(header, source)| {
                let value = source
                    .map(|source| field(record, source).to_string())
                    .unwrap_or_default();
                (header.clone(), value)
            })
            .collect();
        positions.insert(key, outcome.dataset.records.len());
        outcome.dataset.records.push(reprojected);
        outcome.kept += 1;
    }
}

/// For each merged header, the stored column feeding it, if any.
fn map_columns<'a>(
    headers: &'a [String],
    stored_headers: &'a [String],
    key_column: &str,
    stored_key: &'a str,
) -> Vec<(&'a String, Option<&'a str>)> {
    headers
        .iter()
        .map(|header| {
            if header == key_column {
                return (header, Some(stored_key));
            }
            let source = stored_headers
                .iter()
                .find(|stored| *stored == header)
                .or_else(|| {
                    let wanted = normalize_column_name(header);
                    stored_headers
                        .iter()
                        .find(|stored| normalize_column_name(stored) == wanted)
                })
                .map(String::as_str);
            (header, source)
        })
        .collect()
}
