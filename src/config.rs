//! The config module holds the declarative portal descriptor: endpoints, field
//! maps, enrichment steps and batch tuning, loaded from JSON.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::DatasetKind;
use crate::constants::{
    DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE, DEFAULT_CONFIG_JSON, DEFAULT_ENCODING_LABEL,
    DEFAULT_PERIOD, DEFAULT_TIMEOUT_MS,
};
use crate::parse::Selector;
use crate::view::DerivedColumn;

/// Full description of the portal and of how each dataset is captured from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Scheme and host, e.g. `https://portal.example.edu`
    pub base_url: String,
    /// Path prefix joined in front of every endpoint
    #[serde(default)]
    pub base_path: String,
    /// Label of the single-byte encoding the portal responds in
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Period used when the current-period lookup fails, as `"YYYY/T"`
    #[serde(default = "default_period")]
    pub default_period: String,
    #[serde(default)]
    pub period: Option<PeriodLookup>,
    pub offerings: ExtractionPlan,
    pub students: ExtractionPlan,
}

fn default_encoding() -> String {
    DEFAULT_ENCODING_LABEL.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_delay_ms() -> u64 {
    DEFAULT_BATCH_DELAY_MS
}

fn default_period() -> String {
    DEFAULT_PERIOD.to_string()
}

/// Endpoint answering with the academic period currently open on the portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodLookup {
    pub endpoint: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Applied to the first row, or to the document root when there are no rows.
    pub field: FieldSpec,
}

/// How one dataset kind is captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPlan {
    pub root: EndpointSpec,
    #[serde(default)]
    pub enrichments: Vec<EnrichmentSpec>,
    #[serde(default)]
    pub lookups: Vec<LookupSpec>,
    /// Natural key column names, in order of preference, including legacy variants.
    pub key_candidates: Vec<String>,
    #[serde(default)]
    pub derived: Vec<DerivedColumn>,
}

impl ExtractionPlan {
    /// Column names produced by a run of this plan, in output order.
    pub fn columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let enrichment_fields = self.enrichments.iter().flat_map(|e| e.request.fields.iter());
        for field in self.root.fields.iter().chain(enrichment_fields) {
            if !columns.contains(&field.column) {
                columns.push(field.column.clone());
            }
        }
        for lookup in &self.lookups {
            if !columns.contains(&lookup.column) {
                columns.push(lookup.column.clone());
            }
        }
        columns
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub endpoint: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub fields: Vec<FieldSpec>,
}

/// A dependent fetch issued once per root row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentSpec {
    pub name: String,
    #[serde(flatten)]
    pub request: EndpointSpec,
    /// Code/name columns of this enrichment that feed the reference cache.
    #[serde(default)]
    pub reference: Option<ReferenceCapture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceCapture {
    pub code: String,
    pub name: String,
}

/// A column filled from the reference cache at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSpec {
    pub column: String,
    pub code: ValueSource,
}

/// One query parameter of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub source: ValueSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// A key of the caller's selection parameters
    Selection(String),
    /// Part of the resolved academic period
    Period(PeriodPart),
    /// A column of the row being enriched
    Column(String),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodPart {
    Year,
    Term,
}

/// Maps one output column to a selector and an optional named transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub column: String,
    pub select: Selector,
    #[serde(default)]
    pub transform: Option<String>,
    /// Component of a structured transform result, e.g. `code` or `name`
    #[serde(default)]
    pub part: Option<String>,
}

impl PortalConfig {
    /// Loads the descriptor from `path`, or the embedded default when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON for the
    /// descriptor, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_json(&json)
                    .with_context(|| format!("Invalid config file {}", path.display()))
            }
            None => Self::from_json(DEFAULT_CONFIG_JSON).context("Invalid embedded config"),
        }
    }

    /// Parses and validates a descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or validation fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be greater than zero");
        }
        if encoding_rs::Encoding::for_label(self.encoding.as_bytes()).is_none() {
            bail!("Unknown encoding label: {}", self.encoding);
        }
        for kind in DatasetKind::ALL {
            let plan = self.plan(kind);
            if plan.root.fields.is_empty() {
                bail!("{kind} plan has no root fields");
            }
            if plan.key_candidates.is_empty() {
                bail!("{kind} plan has no key candidates");
            }
            if let Some(enrichment) = plan.enrichments.iter().find(|e| e.request.fields.is_empty()) {
                bail!("{kind} enrichment {} has no fields", enrichment.name);
            }
        }
        Ok(())
    }

    pub fn plan(&self, kind: DatasetKind) -> &ExtractionPlan {
        match kind {
            DatasetKind::Offerings => &self.offerings,
            DatasetKind::Students => &self.students,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}
