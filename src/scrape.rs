//! The scrape module drives one extraction run: fetch the root listing, enrich
//! every row through dependent fetches in bounded batches, and hand back the
//! records in listing order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::{
    EnrichmentSpec, ExtractionPlan, ParamSpec, PeriodLookup, PeriodPart, PortalConfig, ValueSource,
};
use crate::constants::MULTI_VALUE_SEPARATOR;
use crate::fetch::{FetchError, QueryParams, XmlSource};
use crate::parse::extract;
use crate::reference::ReferenceCache;
use crate::table::{Dataset, Record, field};
use crate::transform::{YearTerm, parse_year_term};

/// Caller-supplied selection, e.g. `course=123`. The `period` key, when
/// present, overrides the current-period lookup.
pub type Selection = HashMap<String, String>;

pub const PERIOD_SELECTION_KEY: &str = "period";

/// Batch tuning of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Enrichment fetches in flight at once; never zero
    pub batch_size: usize,
    /// Pause between two batches
    pub delay: Duration,
    /// Per-request timeout
    pub timeout: Duration,
}

impl BatchSettings {
    pub fn from_config(config: &PortalConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            delay: config.batch_delay(),
            timeout: config.timeout(),
        }
    }
}

/// Cooperative cancellation flag, checked at batch boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    FetchingRoot,
    EnrichingBatch(usize),
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

/// Reported after every completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub elapsed_ms: u64,
}

/// A failure confined to one row. The row is kept with blank fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Position of the row in the root listing
    pub row: usize,
    /// `root`, or the name of the enrichment step that failed
    pub stage: String,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "row {} [{}]: {}", self.row + 1, self.stage, self.message)
    }
}

/// Failures that end a run without any records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("Invalid academic period {0:?}")]
    InvalidPeriod(String),
    #[error("Root listing {endpoint} failed: {source}")]
    RootFetch {
        endpoint: String,
        source: FetchError,
    },
    #[error("Root listing {0} returned no rows")]
    EmptyListing(String),
}

/// Records of a finished or cancelled run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub headers: Vec<String>,
    /// Enriched records in root listing order
    pub records: Vec<Record>,
    pub errors: Vec<RowError>,
    pub period: Option<YearTerm>,
    /// Rows in the root listing
    pub total_rows: usize,
    /// `Done` or `Cancelled`
    pub state: RunState,
}

impl RunOutcome {
    fn cancelled_before_start() -> Self {
        Self {
            headers: Vec::new(),
            records: Vec::new(),
            errors: Vec::new(),
            period: None,
            total_rows: 0,
            state: RunState::Cancelled,
        }
    }

    /// True when the run stopped before enriching every root row.
    pub fn is_partial(&self) -> bool {
        self.state == RunState::Cancelled
    }

    pub fn to_dataset(&self) -> Dataset {
        let mut dataset = Dataset::new(self.headers.clone());
        for record in &self.records {
            dataset.push(record);
        }
        dataset
    }
}

/// Runs extraction plans against an `XmlSource`.
pub struct Orchestrator {
    source: Arc<dyn XmlSource>,
    cache: Arc<Mutex<ReferenceCache>>,
    settings: BatchSettings,
    period_lookup: Option<PeriodLookup>,
    default_period: String,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn XmlSource>,
        cache: Arc<Mutex<ReferenceCache>>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            source,
            cache,
            settings: BatchSettings {
                batch_size: settings.batch_size.max(1),
                ..settings
            },
            period_lookup: None,
            default_period: crate::constants::DEFAULT_PERIOD.to_string(),
        }
    }

    /// Sets the current-period endpoint and the fallback used when it fails.
    pub fn with_period_lookup(mut self, lookup: Option<PeriodLookup>, default_period: &str) -> Self {
        self.period_lookup = lookup;
        self.default_period = default_period.to_string();
        self
    }

    /// Resolves the academic period of a run: explicit selection first, then
    /// the portal's current period, then the configured default.
    ///
    /// # Errors
    ///
    /// Returns `RunError::InvalidPeriod` if the explicit or default period is malformed.
    pub async fn resolve_period(&self, selection: &Selection) -> Result<YearTerm, RunError> {
        if let Some(explicit) = selection.get(PERIOD_SELECTION_KEY) {
            return parse_year_term(explicit).map_err(|_| RunError::InvalidPeriod(explicit.clone()));
        }

        if let Some(lookup) = &self.period_lookup {
            match self.lookup_period(lookup, selection).await {
                Ok(period) => return Ok(period),
                Err(reason) => warn!(
                    "Current period lookup failed ({reason}); using default {}",
                    self.default_period
                ),
            }
        }

        parse_year_term(&self.default_period)
            .map_err(|_| RunError::InvalidPeriod(self.default_period.clone()))
    }

    async fn lookup_period(
        &self,
        lookup: &PeriodLookup,
        selection: &Selection,
    ) -> Result<YearTerm, String> {
        let params = build_params(&lookup.params, selection, None, None);
        let fragment = self
            .source
            .fetch_xml(&lookup.endpoint, &params, self.settings.timeout)
            .await
            .map_err(|e| e.to_string())?;

        let rows = fragment.rows();
        let element = rows.first().copied().unwrap_or(&fragment.root);
        let extraction = extract(element, std::slice::from_ref(&lookup.field));
        let token = field(&extraction.record, &lookup.field.column);
        parse_year_term(token).map_err(|e| e.to_string())
    }

    /// Runs `plan` for `selection`.
    ///
    /// Root rows are enriched in batches of `batch_size` concurrent rows with a
    /// pause between batches. `on_progress` is called once per completed batch.
    /// Cancellation is honoured between batches; the records of completed
    /// batches are returned and the outcome is marked partial.
    ///
    /// # Arguments
    ///
    /// * `plan` - Root listing, enrichments and lookups to run
    /// * `selection` - Caller selection feeding request parameters
    /// * `cancel` - Cooperative cancellation flag
    /// * `on_progress` - Synchronous progress observer
    ///
    /// # Errors
    ///
    /// Returns a `RunError` when the period is invalid or the root listing
    /// fails, is malformed or is empty. Enrichment failures never end a run;
    /// they are reported in `RunOutcome::errors`.
    pub async fn run<P>(
        &self,
        plan: &ExtractionPlan,
        selection: &Selection,
        cancel: &CancelToken,
        mut on_progress: P,
    ) -> Result<RunOutcome, RunError>
    where
        P: FnMut(Progress),
    {
        let started = Instant::now();
        let mut state = RunState::Idle;
        if cancel.is_cancelled() {
            enter(&mut state, RunState::Cancelled);
            return Ok(RunOutcome::cancelled_before_start());
        }

        enter(&mut state, RunState::FetchingRoot);
        let (period, mut records, mut errors) = match self.fetch_root(plan, selection).await {
            Ok(root) => root,
            Err(err) => {
                enter(&mut state, RunState::Failed);
                return Err(err);
            }
        };
        let total = records.len();
        info!("Root listing {} returned {total} rows", plan.root.endpoint);

        let context = Arc::new(EnrichContext {
            source: Arc::clone(&self.source),
            cache: Arc::clone(&self.cache),
            enrichments: plan.enrichments.clone(),
            selection: selection.clone(),
            period: period.clone(),
            timeout: self.settings.timeout,
        });
        let batch_size = self.settings.batch_size;
        let batch_count = total.div_ceil(batch_size);
        let mut completed = 0;
        let mut cancelled = false;

        for (batch_index, batch) in records.chunks_mut(batch_size).enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            enter(&mut state, RunState::EnrichingBatch(batch_index));

            errors.extend(enrich_batch(&context, completed, batch).await);
            completed += batch.len();
            info!("Batch {}/{batch_count} done ({completed}/{total} rows)", batch_index + 1);
            on_progress(Progress {
                processed: completed,
                total,
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });

            if batch_index + 1 < batch_count {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                tokio::time::sleep(self.settings.delay).await;
            }
        }

        enter(&mut state, RunState::Finalizing);
        records.truncate(completed);
        errors.retain(|error| error.row < completed);
        self.fill_lookups(plan, selection, &period, &mut records);

        let headers = plan.columns();
        for record in &mut records {
            for header in &headers {
                record.entry(header.clone()).or_default();
            }
        }

        enter(
            &mut state,
            if cancelled {
                RunState::Cancelled
            } else {
                RunState::Done
            },
        );
        Ok(RunOutcome {
            headers,
            records,
            errors,
            period: Some(period),
            total_rows: total,
            state,
        })
    }

    async fn fetch_root(
        &self,
        plan: &ExtractionPlan,
        selection: &Selection,
    ) -> Result<(YearTerm, Vec<Record>, Vec<RowError>), RunError> {
        let period = self.resolve_period(selection).await?;
        let params = build_params(&plan.root.params, selection, Some(&period), None);
        let fragment = self
            .source
            .fetch_xml(&plan.root.endpoint, &params, self.settings.timeout)
            .await
            .map_err(|source| RunError::RootFetch {
                endpoint: plan.root.endpoint.clone(),
                source,
            })?;

        let rows = fragment.rows();
        if rows.is_empty() {
            return Err(RunError::EmptyListing(plan.root.endpoint.clone()));
        }

        let mut records = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();
        for (index, row) in rows.into_iter().enumerate() {
            let extraction = extract(row, &plan.root.fields);
            errors.extend(extraction.errors.into_iter().map(|error| RowError {
                row: index,
                stage: "root".to_string(),
                message: error.to_string(),
            }));
            records.push(extraction.record);
        }

        Ok((period, records, errors))
    }

    fn fill_lookups(
        &self,
        plan: &ExtractionPlan,
        selection: &Selection,
        period: &YearTerm,
        records: &mut [Record],
    ) {
        if plan.lookups.is_empty() {
            return;
        }
        let Ok(cache) = self.cache.lock() else {
            warn!("Reference cache unavailable; lookup columns left blank");
            return;
        };
        for record in records {
            for lookup in &plan.lookups {
                let name = resolve_value(&lookup.code, selection, Some(period), Some(&*record))
                    .map(|code| cache.get(&code).to_string())
                    .unwrap_or_default();
                record.insert(lookup.column.clone(), name);
            }
        }
    }
}

fn enter(state: &mut RunState, next: RunState) {
    debug!("Run state {state:?} -> {next:?}");
    *state = next;
}

/// Everything a row task needs, shared by all tasks of a run.
struct EnrichContext {
    source: Arc<dyn XmlSource>,
    cache: Arc<Mutex<ReferenceCache>>,
    enrichments: Vec<EnrichmentSpec>,
    selection: Selection,
    period: YearTerm,
    timeout: Duration,
}

#[derive(Default)]
struct RowEnrichment {
    fields: Record,
    /// (stage, message)
    errors: Vec<(String, String)>,
}

impl EnrichContext {
    /// Runs this row's enrichment steps one after another, so a row never has
    /// more than one fetch in flight. This is what keeps a batch at no more
    /// than `batch_size` concurrent fetches; running the steps concurrently
    /// would break that bound.
    async fn enrich_row(&self, record: Record) -> RowEnrichment {
        let mut enrichment = RowEnrichment::default();

        for spec in &self.enrichments {
            for field_spec in &spec.request.fields {
                enrichment.fields.insert(field_spec.column.clone(), String::new());
            }

            if let Some(missing) = missing_column_param(&spec.request.params, &record) {
                debug!("Skipping {} for a row without {missing}", spec.name);
                continue;
            }

            let params = build_params(
                &spec.request.params,
                &self.selection,
                Some(&self.period),
                Some(&record),
            );
            match self
                .source
                .fetch_xml(&spec.request.endpoint, &params, self.timeout)
                .await
            {
                Ok(fragment) => {
                    let mut values: Vec<(String, Vec<String>)> = spec
                        .request
                        .fields
                        .iter()
                        .map(|f| (f.column.clone(), Vec::new()))
                        .collect();

                    for row in fragment.rows() {
                        let extraction = extract(row, &spec.request.fields);
                        enrichment.errors.extend(
                            extraction
                                .errors
                                .iter()
                                .map(|error| (spec.name.clone(), error.to_string())),
                        );
                        if let Some(reference) = &spec.reference {
                            self.remember(
                                field(&extraction.record, &reference.code),
                                field(&extraction.record, &reference.name),
                            );
                        }
                        for (column, seen) in &mut values {
                            let value = field(&extraction.record, column);
                            if !value.is_empty() && !seen.iter().any(|v| v == value) {
                                seen.push(value.to_string());
                            }
                        }
                    }

                    for (column, seen) in values {
                        enrichment
                            .fields
                            .insert(column, seen.join(MULTI_VALUE_SEPARATOR));
                    }
                }
                Err(err) => {
                    warn!("Enrichment {} failed: {err}", spec.name);
                    enrichment.errors.push((spec.name.clone(), err.to_string()));
                }
            }
        }

        enrichment
    }

    /// Feeds an observed code/name pair to the reference cache. Never fails the row.
    fn remember(&self, code: &str, name: &str) {
        match self.cache.lock() {
            Ok(mut cache) => cache.put(code, name),
            Err(_) => warn!("Reference cache unavailable; not recording {code}"),
        }
    }
}

/// Enriches one batch concurrently and writes the results into `batch` in
/// place, so listing order is kept whatever order the fetches finish in.
async fn enrich_batch(
    context: &Arc<EnrichContext>,
    offset: usize,
    batch: &mut [Record],
) -> Vec<RowError> {
    let mut tasks = JoinSet::new();
    let mut task_rows = HashMap::new();
    for (position, record) in batch.iter().enumerate() {
        let context = Arc::clone(context);
        let record = record.clone();
        let handle = tasks.spawn(async move { context.enrich_row(record).await });
        task_rows.insert(handle.id(), position);
    }

    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, enrichment)) => {
                let Some(&position) = task_rows.get(&id) else {
                    continue;
                };
                if let Some(record) = batch.get_mut(position) {
                    record.extend(enrichment.fields);
                }
                errors.extend(enrichment.errors.into_iter().map(|(stage, message)| RowError {
                    row: offset + position,
                    stage,
                    message,
                }));
            }
            Err(join_error) => {
                let position = task_rows.get(&join_error.id()).copied().unwrap_or_default();
                warn!("Enrichment task for row {} aborted: {join_error}", offset + position);
                errors.push(RowError {
                    row: offset + position,
                    stage: "task".to_string(),
                    message: join_error.to_string(),
                });
            }
        }
    }

    errors.sort_by_key(|error| error.row);
    errors
}

fn missing_column_param<'a>(params: &'a [ParamSpec], record: &Record) -> Option<&'a str> {
    params.iter().find_map(|param| match &param.source {
        ValueSource::Column(column) if field(record, column).trim().is_empty() => {
            Some(column.as_str())
        }
        _ => None,
    })
}

fn resolve_value(
    source: &ValueSource,
    selection: &Selection,
    period: Option<&YearTerm>,
    record: Option<&Record>,
) -> Option<String> {
    let value = match source {
        ValueSource::Selection(key) => selection.get(key).cloned(),
        ValueSource::Period(PeriodPart::Year) => period.map(|p| p.year.clone()),
        ValueSource::Period(PeriodPart::Term) => period.map(|p| p.term.clone()),
        ValueSource::Column(column) => record.map(|r| field(r, column).to_string()),
        ValueSource::Literal(value) => Some(value.clone()),
    };
    value.filter(|v| !v.trim().is_empty())
}

fn build_params(
    params: &[ParamSpec],
    selection: &Selection,
    period: Option<&YearTerm>,
    record: Option<&Record>,
) -> QueryParams {
    params
        .iter()
        .map(|param| {
            (
                param.name.clone(),
                resolve_value(&param.source, selection, period, record),
            )
        })
        .collect()
}
