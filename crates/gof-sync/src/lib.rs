//! Sync pipeline: list, fetch, normalize, tabulate, compose and index grant opportunities.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use csv::{QuoteStyle, WriterBuilder};
use futures::stream::{self, StreamExt};
use gof_adapters::{
    dedupe_summaries, extract_eligibilities, AdapterContext, GrantsGovAdapter, ListingQuery,
    OpportunitySource,
};
use gof_core::{
    date_key, ComposedRow, GrantsError, NormalizedRow, RawDetailRecord, Stage, CORE_COLUMNS,
};
use gof_index::{
    provider_from_config, EmbeddingProvider, IndexBuilder, IndexConfig, IndexHandle, ProviderKind,
};
use gof_storage::{ArtifactLayout, ArtifactStore, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gof-sync";

const OPPORTUNITY_ID_KEYS: &[&str] = &["opportunityId"];
const DESCRIPTION_KEYS: &[&str] = &["synopsisDesc", "forecastDesc"];
const ELIGIBILITY_KEYS: &[&str] = &["applicantEligibilityDesc"];
const APPLICANT_TYPES_KEY: &str = "applicantTypes";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub api_base: String,
    pub search_page_url: String,
    pub origin: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub listing_rows: u32,
    pub listing_date_range: String,
    pub fields_file: Option<PathBuf>,
    pub index: IndexConfig,
}

impl SyncConfig {
    /// Reads `GOF_*` settings; `provider` overrides `EMBEDDING_PROVIDER`.
    pub fn from_env(provider: Option<ProviderKind>) -> Result<Self> {
        Ok(Self {
            data_dir: std::env::var("GOF_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/synopsis")),
            artifacts_dir: std::env::var("GOF_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            api_base: std::env::var("GOF_API_BASE")
                .unwrap_or_else(|_| "https://apply07.grants.gov/grantsws/rest".to_string()),
            search_page_url: std::env::var("GOF_SEARCH_PAGE_URL")
                .unwrap_or_else(|_| "https://grants.gov/search-grants".to_string()),
            origin: std::env::var("GOF_ORIGIN").unwrap_or_else(|_| "https://grants.gov".to_string()),
            user_agent: std::env::var("GOF_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36".to_string()
            }),
            http_timeout_secs: std::env::var("GOF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            fetch_concurrency: std::env::var("GOF_FETCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            listing_rows: std::env::var("GOF_LISTING_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            listing_date_range: std::env::var("GOF_LISTING_DATE_RANGE")
                .unwrap_or_else(|_| "3".to_string()),
            fields_file: std::env::var("GOF_FIELDS_FILE").ok().map(PathBuf::from),
            index: IndexConfig::from_env(provider)?,
        })
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(self.data_dir.clone())
    }

    pub fn listing_query(&self) -> ListingQuery {
        ListingQuery {
            rows: self.listing_rows,
            date_range: self.listing_date_range.clone(),
            ..Default::default()
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            origin: Some(self.origin.clone()),
            concurrency: self.fetch_concurrency,
        }
    }

    pub fn row_schema(&self) -> Result<RowSchema> {
        match &self.fields_file {
            Some(path) => RowSchema::from_yaml_file(path),
            None => Ok(RowSchema::core()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SourceKeys {
    One(String),
    Many(Vec<String>),
}

impl SourceKeys {
    pub fn keys(&self) -> Vec<&str> {
        match self {
            SourceKeys::One(key) => vec![key.as_str()],
            SourceKeys::Many(keys) => keys.iter().map(String::as_str).collect(),
        }
    }
}

/// Extended output column and the sub-record key(s) it is read from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldMapping {
    pub column: String,
    pub source: SourceKeys,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    fields: Vec<FieldMapping>,
}

/// Output columns: the four core columns, then any configured extended columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSchema {
    extra: Vec<FieldMapping>,
}

impl RowSchema {
    pub fn core() -> Self {
        Self::default()
    }

    pub fn with_extra(extra: Vec<FieldMapping>) -> Result<Self, GrantsError> {
        let mut seen: Vec<&str> = CORE_COLUMNS.to_vec();
        for field in &extra {
            let column = field.column.trim();
            if column.is_empty() {
                return Err(GrantsError::Configuration(
                    "extended field with an empty column name".to_string(),
                ));
            }
            if seen.contains(&column) {
                return Err(GrantsError::Configuration(format!(
                    "duplicate output column {column:?}"
                )));
            }
            if field.source.keys().is_empty() {
                return Err(GrantsError::Configuration(format!(
                    "column {column:?} has no source keys"
                )));
            }
            seen.push(column);
        }
        Ok(Self { extra })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, GrantsError> {
        let file: FieldsFile = serde_yaml::from_str(text)
            .map_err(|e| GrantsError::Configuration(format!("parsing fields file: {e}")))?;
        Self::with_extra(file.fields)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn extra(&self) -> &[FieldMapping] {
        &self.extra
    }

    pub fn header(&self) -> Vec<&str> {
        CORE_COLUMNS
            .iter()
            .copied()
            .chain(self.extra.iter().map(|f| f.column.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub index: usize,
    pub opportunity_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub rows: Vec<NormalizedRow>,
    pub skipped: Vec<SkippedRecord>,
}

/// Normalize with the core column set.
pub fn normalize(records: &[RawDetailRecord]) -> NormalizeReport {
    Normalizer::new(RowSchema::core()).normalize(records)
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    schema: RowSchema,
}

impl Normalizer {
    pub fn new(schema: RowSchema) -> Self {
        Self { schema }
    }

    /// Never fails: records that cannot be read are reported as skipped, in input order.
    pub fn normalize(&self, records: &[RawDetailRecord]) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        for (index, record) in records.iter().enumerate() {
            match self.normalize_record(index, record) {
                Ok(row) => report.rows.push(row),
                Err(err) => {
                    let reason = match err {
                        GrantsError::MalformedRecord { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    debug!(index, %reason, "skipping detail record");
                    report.skipped.push(SkippedRecord {
                        index,
                        opportunity_id: record.opportunity_id_hint(),
                        reason,
                    });
                }
            }
        }
        report
    }

    pub fn normalize_record(
        &self,
        index: usize,
        record: &RawDetailRecord,
    ) -> Result<NormalizedRow, GrantsError> {
        let root = record.as_object().ok_or_else(|| GrantsError::MalformedRecord {
            index,
            reason: format!("record is {}, expected an object", json_kind(&record.0)),
        })?;
        let synopsis = sub_record(root, "synopsis", index);
        let forecast = sub_record(root, "forecast", index);
        let pick = |keys: &[&str]| first_truthy(synopsis, forecast, keys);

        let mut applicant_types = applicant_type_names(synopsis);
        applicant_types.extend(applicant_type_names(forecast));

        let extra = self
            .schema
            .extra
            .iter()
            .map(|field| (field.column.clone(), pick(field.source.keys().as_slice())))
            .collect::<BTreeMap<_, _>>();

        Ok(NormalizedRow {
            opportunity_id: pick(OPPORTUNITY_ID_KEYS),
            description: pick(DESCRIPTION_KEYS),
            applicant_eligibility_desc: pick(ELIGIBILITY_KEYS),
            applicant_types: applicant_types.join(","),
            extra,
        })
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

// A wrong-typed sub-record reads as absent so the record still yields a row.
fn sub_record<'a>(
    root: &'a Map<String, JsonValue>,
    name: &str,
    index: usize,
) -> Option<&'a Map<String, JsonValue>> {
    match root.get(name) {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Object(map)) => Some(map),
        Some(other) => {
            debug!(index, "{name} is {}, expected an object", json_kind(other));
            None
        }
    }
}

/// Non-null, non-empty scalars only; objects and arrays count as missing.
fn truthy_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `synopsis.key` if truthy, else `forecast.key`, else "".
fn first_truthy(
    synopsis: Option<&Map<String, JsonValue>>,
    forecast: Option<&Map<String, JsonValue>>,
    keys: &[&str],
) -> String {
    [synopsis, forecast]
        .into_iter()
        .flatten()
        .flat_map(|sub| keys.iter().filter_map(move |key| sub.get(*key)))
        .find_map(truthy_text)
        .unwrap_or_default()
}

// Entries without a description still occupy a slot in the joined list.
fn applicant_type_names(sub: Option<&Map<String, JsonValue>>) -> Vec<String> {
    sub.and_then(|m| m.get(APPLICANT_TYPES_KEY))
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    entry
                        .get("description")
                        .and_then(truthy_text)
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn csv_writer(path: &Path, stage: Stage) -> Result<csv::Writer<File>, GrantsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| GrantsError::artifact(stage, parent, e))?;
    }
    WriterBuilder::new()
        .quote_style(QuoteStyle::NonNumeric)
        .from_path(path)
        .map_err(|e| GrantsError::artifact(stage, path, e))
}

/// Write a fresh CSV (header + one line per row), replacing any existing file.
pub fn write_rows(
    rows: &[NormalizedRow],
    schema: &RowSchema,
    path: &Path,
) -> Result<PathBuf, GrantsError> {
    let fail = |e: csv::Error| GrantsError::artifact(Stage::Write, path, e);
    let mut writer = csv_writer(path, Stage::Write)?;
    writer.write_record(schema.header()).map_err(fail)?;
    for row in rows {
        let mut record: Vec<&str> = row.core_values().to_vec();
        record.extend(schema.extra().iter().map(|field| {
            row.extra
                .get(&field.column)
                .map(String::as_str)
                .unwrap_or_default()
        }));
        writer.write_record(&record).map_err(fail)?;
    }
    writer
        .flush()
        .map_err(|e| GrantsError::artifact(Stage::Write, path, e))?;
    Ok(path.to_path_buf())
}

/// Read a normalized CSV back; columns beyond the core four land in `extra`.
pub fn read_rows(path: &Path) -> Result<Vec<NormalizedRow>, GrantsError> {
    let fail = |e: csv::Error| GrantsError::artifact(Stage::Compose, path, e);
    let mut reader = csv::Reader::from_path(path).map_err(fail)?;
    let headers = reader.headers().map_err(fail)?.clone();

    let mut core_positions = [0usize; 4];
    for (slot, column) in core_positions.iter_mut().zip(CORE_COLUMNS) {
        *slot = headers.iter().position(|h| h == column).ok_or_else(|| {
            GrantsError::artifact(Stage::Compose, path, format!("missing column {column}"))
        })?;
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(fail)?;
        let cell = |i: usize| record.get(i).unwrap_or_default().to_string();
        let extra = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| !core_positions.contains(i))
            .map(|(i, name)| (name.to_string(), cell(i)))
            .collect();
        rows.push(NormalizedRow {
            opportunity_id: cell(core_positions[0]),
            description: cell(core_positions[1]),
            applicant_eligibility_desc: cell(core_positions[2]),
            applicant_types: cell(core_positions[3]),
            extra,
        });
    }
    Ok(rows)
}

pub fn compose_description(row: &NormalizedRow) -> String {
    format!(
        "Synopsis Description: {}. Applicant Eligibility Description: {}. Applicant Types: {}",
        row.description.trim(),
        row.applicant_eligibility_desc.trim(),
        row.applicant_types.trim()
    )
    .trim()
    .to_string()
}

pub fn compose(rows: &[NormalizedRow]) -> Vec<ComposedRow> {
    rows.iter()
        .map(|row| ComposedRow {
            opportunity_id: row.opportunity_id.clone(),
            description: compose_description(row),
        })
        .collect()
}

pub fn write_composed(rows: &[ComposedRow], path: &Path) -> Result<PathBuf, GrantsError> {
    let fail = |e: csv::Error| GrantsError::artifact(Stage::Compose, path, e);
    let mut writer = csv_writer(path, Stage::Compose)?;
    for row in rows {
        writer.serialize(row).map_err(fail)?;
    }
    if rows.is_empty() {
        writer
            .write_record(gof_core::COMBINED_COLUMNS)
            .map_err(fail)?;
    }
    writer
        .flush()
        .map_err(|e| GrantsError::artifact(Stage::Compose, path, e))?;
    Ok(path.to_path_buf())
}

pub fn read_composed(path: &Path) -> Result<Vec<ComposedRow>, GrantsError> {
    let fail = |e: csv::Error| GrantsError::artifact(Stage::Index, path, e);
    let mut reader = csv::Reader::from_path(path).map_err(fail)?;
    reader
        .deserialize::<ComposedRow>()
        .map(|row| row.map_err(fail))
        .collect()
}

/// Normalize a detail batch and write the dated CSV.
pub fn normalize_to_csv(
    records: &[RawDetailRecord],
    schema: &RowSchema,
    layout: &ArtifactLayout,
    date: NaiveDate,
) -> Result<(NormalizeReport, PathBuf), GrantsError> {
    let report = Normalizer::new(schema.clone()).normalize(records);
    let path = write_rows(&report.rows, schema, &layout.normalized_csv(date))?;
    info!(
        rows = report.rows.len(),
        skipped = report.skipped.len(),
        path = %path.display(),
        "normalized rows written"
    );
    Ok((report, path))
}

/// Read the dated normalized CSV and write the dated combined CSV.
pub fn compose_for_date(
    layout: &ArtifactLayout,
    date: NaiveDate,
) -> Result<(Vec<ComposedRow>, PathBuf), GrantsError> {
    let rows = read_rows(&layout.normalized_csv(date))?;
    let composed = compose(&rows);
    let path = write_composed(&composed, &layout.combined_csv(date))?;
    info!(rows = composed.len(), path = %path.display(), "combined descriptions written");
    Ok((composed, path))
}

/// Build (or reuse) the dated index from the dated combined CSV.
pub async fn index_for_date(
    layout: &ArtifactLayout,
    date: NaiveDate,
    builder: &IndexBuilder,
) -> Result<IndexHandle, GrantsError> {
    let combined = layout.combined_csv(date);
    let rows = read_composed(&combined)?;
    builder
        .build_or_load(&rows, &combined.display().to_string(), layout, date)
        .await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFetch {
    pub opportunity_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DetailBatch {
    pub records: Vec<RawDetailRecord>,
    pub failures: Vec<FailedFetch>,
}

/// Fetch details with at most `concurrency` requests in flight.
///
/// A failing id is recorded and skipped; successes keep the order of `ids`.
pub async fn fetch_details(
    source: &dyn OpportunitySource,
    ctx: &AdapterContext,
    ids: &[String],
    concurrency: usize,
) -> DetailBatch {
    let mut results = stream::iter(ids.iter().enumerate())
        .map(|(position, id)| async move { (position, id, source.fetch_detail(ctx, id).await) })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;
    results.sort_by_key(|(position, _, _)| *position);

    let mut batch = DetailBatch::default();
    for (_, id, result) in results {
        match result {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                warn!(opportunity_id = %id, error = %err, "detail fetch failed");
                batch.failures.push(FailedFetch {
                    opportunity_id: id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    batch
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub date: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub duplicates_dropped: usize,
    pub fetched: usize,
    pub failed: Vec<FailedFetch>,
    pub skipped: Vec<SkippedRecord>,
    pub rows_written: usize,
    pub normalized_csv: String,
    pub combined_csv: String,
    pub index_dir: String,
    pub index_reused: bool,
    pub indexed_chunks: usize,
    pub report_path: String,
}

pub struct SyncOutcome {
    pub summary: SyncRunSummary,
    pub index: IndexHandle,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    layout: ArtifactLayout,
    artifacts: ArtifactStore,
    schema: RowSchema,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let schema = config.row_schema()?;
        Ok(Self {
            layout: config.layout(),
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            config,
            http,
            schema,
        })
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn adapter(&self) -> GrantsGovAdapter<'_> {
        GrantsGovAdapter::new(&self.http, self.config.api_base.clone())
            .with_query(self.config.listing_query())
            .with_artifact_store(self.artifacts.clone())
    }

    pub async fn eligibilities(&self) -> Result<Vec<String>, GrantsError> {
        extract_eligibilities(&self.http, &self.config.search_page_url).await
    }

    pub fn index_builder(&self, provider: Arc<dyn EmbeddingProvider>) -> IndexBuilder {
        IndexBuilder::new(provider).with_chunk_settings(self.config.index.chunk)
    }

    /// Run every stage for `date`. Listing and artifact failures abort the run.
    pub async fn run_once(
        &self,
        date: NaiveDate,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<SyncOutcome> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, date = %date_key(date));
        self.run_stages(run_id, started_at, date, provider)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        date: NaiveDate,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<SyncOutcome> {
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };
        self.layout.ensure_data_dir().await?;
        let adapter = self.adapter();

        let summaries = adapter.list_opportunities(&ctx).await?;
        let listed = summaries.len();
        let summaries = dedupe_summaries(summaries);
        let duplicates_dropped = listed - summaries.len();
        info!(listed, duplicates_dropped, "listing complete");

        let ids: Vec<String> = summaries.into_iter().map(|s| s.id).collect();
        let batch = fetch_details(&adapter, &ctx, &ids, self.config.fetch_concurrency).await;
        info!(
            fetched = batch.records.len(),
            failed = batch.failures.len(),
            "detail fetch complete"
        );
        self.write_detail_batch(date, &batch.records).await?;

        let (report, normalized_csv) =
            normalize_to_csv(&batch.records, &self.schema, &self.layout, date)?;
        let (composed, combined_csv) = compose_for_date(&self.layout, date)?;
        let index = self
            .index_builder(provider)
            .build_or_load(
                &composed,
                &combined_csv.display().to_string(),
                &self.layout,
                date,
            )
            .await?;

        let report_path = self
            .layout
            .reports_dir()
            .join(format!("{}-{run_id}.json", date_key(date)));
        let summary = SyncRunSummary {
            run_id,
            date: date_key(date),
            started_at,
            finished_at: Utc::now(),
            listed,
            duplicates_dropped,
            fetched: batch.records.len(),
            failed: batch.failures,
            skipped: report.skipped,
            rows_written: report.rows.len(),
            normalized_csv: normalized_csv.display().to_string(),
            combined_csv: combined_csv.display().to_string(),
            index_dir: index.dir().display().to_string(),
            index_reused: index.reused(),
            indexed_chunks: index.chunks().len(),
            report_path: report_path.display().to_string(),
        };
        write_run_report(&report_path, &summary).await?;
        info!(report = %report_path.display(), "sync run complete");

        Ok(SyncOutcome { summary, index })
    }

    async fn write_detail_batch(&self, date: NaiveDate, records: &[RawDetailRecord]) -> Result<()> {
        let path = self.layout.details_json(date);
        let bytes = serde_json::to_vec_pretty(records).context("serializing detail batch")?;
        fs::write(&path, bytes)
            .await
            .map_err(|e| GrantsError::artifact(Stage::Detail, &path, e))?;
        Ok(())
    }
}

async fn write_run_report(path: &Path, summary: &SyncRunSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Full run for `date`. The embedding provider is resolved before any fetch.
pub async fn run_sync_once(config: SyncConfig, date: NaiveDate) -> Result<SyncOutcome> {
    let provider = provider_from_config(&config.index)?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(date, provider).await
}
