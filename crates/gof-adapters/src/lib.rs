//! Source adapter contract + the grants.gov listing, detail and eligibility adapters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gof_core::{GrantsError, OpportunitySummary, RawDetailRecord, Stage};
use gof_storage::{ArtifactStore, FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gof-adapters";

pub const GRANTS_GOV_SOURCE_ID: &str = "grants-gov";

/// Checkbox labels of the eligibility filter on the search page.
pub const ELIGIBILITY_LABEL_SELECTOR: &str = "#m-a2 label.usa-checkbox__label.margin-top-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait OpportunitySource: Send + Sync {
    /// One bulk search; a non-success status or a payload without hits is fatal.
    async fn list_opportunities(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<OpportunitySummary>, GrantsError>;

    /// Raw detail payload for one id, passed through unvalidated.
    async fn fetch_detail(
        &self,
        ctx: &AdapterContext,
        opportunity_id: &str,
    ) -> Result<RawDetailRecord, GrantsError>;
}

/// Fixed body of the bulk search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingQuery {
    pub keyword: Option<String>,
    pub opp_num: Option<String>,
    pub cfda: Option<String>,
    pub agencies: Option<String>,
    pub sort_by: String,
    pub rows: u32,
    pub eligibilities: Option<String>,
    pub funding_categories: Option<String>,
    pub funding_instruments: Option<String>,
    pub date_range: String,
    pub opp_statuses: String,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self {
            keyword: None,
            opp_num: None,
            cfda: None,
            agencies: None,
            sort_by: "openDate|desc".to_string(),
            rows: 5000,
            eligibilities: None,
            funding_categories: None,
            funding_instruments: None,
            date_range: "3".to_string(),
            opp_statuses: "forecasted|posted".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct GrantsGovAdapter<'a> {
    http: &'a HttpFetcher,
    api_base: String,
    query: ListingQuery,
    artifacts: Option<ArtifactStore>,
}

impl<'a> GrantsGovAdapter<'a> {
    pub fn new(http: &'a HttpFetcher, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            query: ListingQuery::default(),
            artifacts: None,
        }
    }

    pub fn with_query(mut self, query: ListingQuery) -> Self {
        self.query = query;
        self
    }

    /// Keep every raw response body in a hash-addressed store.
    pub fn with_artifact_store(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn listing_url(&self) -> String {
        format!("{}/opportunities/search", self.api_base)
    }

    pub fn detail_url(&self) -> String {
        format!("{}/opportunity/details", self.api_base)
    }

    async fn retain_raw(&self, ctx: &AdapterContext, body: &[u8]) {
        let Some(store) = &self.artifacts else {
            return;
        };
        match store
            .store_bytes(ctx.fetched_at, GRANTS_GOV_SOURCE_ID, "json", body)
            .await
        {
            Ok(stored) => debug!(path = %stored.relative_path.display(), "raw payload stored"),
            Err(err) => warn!(error = %err, "failed to store raw payload"),
        }
    }
}

#[async_trait]
impl OpportunitySource for GrantsGovAdapter<'_> {
    async fn list_opportunities(
        &self,
        ctx: &AdapterContext,
    ) -> Result<Vec<OpportunitySummary>, GrantsError> {
        let resp = self
            .http
            .post_json(&self.listing_url(), &self.query)
            .await
            .map_err(|err| fetch_failure(Stage::Listing, None, err))?;
        self.retain_raw(ctx, &resp.body).await;
        parse_listing_payload(&resp.body)
    }

    async fn fetch_detail(
        &self,
        ctx: &AdapterContext,
        opportunity_id: &str,
    ) -> Result<RawDetailRecord, GrantsError> {
        let resp = self
            .http
            .post_form(&self.detail_url(), &[("oppId", opportunity_id)])
            .await
            .map_err(|err| fetch_failure(Stage::Detail, Some(opportunity_id), err))?;
        self.retain_raw(ctx, &resp.body).await;
        parse_detail_payload(opportunity_id, &resp.body)
    }
}

fn fetch_failure(stage: Stage, opportunity_id: Option<&str>, err: FetchError) -> GrantsError {
    GrantsError::RemoteService {
        stage,
        opportunity_id: opportunity_id.map(str::to_string),
        message: err.to_string(),
    }
}

/// Pull the `oppHits` array out of a search response. Hits without an id are dropped.
pub fn parse_listing_payload(body: &[u8]) -> Result<Vec<OpportunitySummary>, GrantsError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| GrantsError::remote(Stage::Listing, format!("invalid JSON: {e}")))?;
    let hits = value
        .get("oppHits")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            GrantsError::remote(Stage::Listing, "response is missing the oppHits array")
        })?;

    let mut out = Vec::with_capacity(hits.len());
    for (index, hit) in hits.iter().enumerate() {
        match OpportunitySummary::deserialize(hit) {
            Ok(summary) => out.push(summary),
            Err(err) => warn!(index, error = %err, "skipping listing hit without usable id"),
        }
    }
    Ok(out)
}

pub fn parse_detail_payload(
    opportunity_id: &str,
    body: &[u8],
) -> Result<RawDetailRecord, GrantsError> {
    serde_json::from_slice(body)
        .map(RawDetailRecord::new)
        .map_err(|e| GrantsError::remote_for(Stage::Detail, opportunity_id, format!("invalid JSON: {e}")))
}

/// Collapse repeated listing ids, first occurrence wins.
pub fn dedupe_summaries(summaries: Vec<OpportunitySummary>) -> Vec<OpportunitySummary> {
    let mut seen = std::collections::HashSet::new();
    summaries
        .into_iter()
        .filter(|s| seen.insert(s.id.clone()))
        .collect()
}

/// Supplies the rendered HTML of a page. Rendering strategy is the implementor's concern.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page_html(&self, url: &str) -> Result<String, GrantsError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn page_html(&self, url: &str) -> Result<String, GrantsError> {
        let resp = self
            .get(url)
            .await
            .map_err(|err| fetch_failure(Stage::Eligibility, None, err))?;
        String::from_utf8(resp.body)
            .map_err(|e| GrantsError::remote(Stage::Eligibility, format!("page is not UTF-8: {e}")))
    }
}

pub async fn extract_eligibilities(
    pages: &dyn PageSource,
    search_page_url: &str,
) -> Result<Vec<String>, GrantsError> {
    let html = pages.page_html(search_page_url).await?;
    parse_eligibility_labels(&html)
}

/// Category names from the eligibility checkboxes: label text before the first `(`.
pub fn parse_eligibility_labels(html: &str) -> Result<Vec<String>, GrantsError> {
    let selector = Selector::parse(ELIGIBILITY_LABEL_SELECTOR)
        .map_err(|e| GrantsError::Configuration(format!("bad eligibility selector: {e}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .map(|label| {
            let text = label.text().collect::<String>();
            text.split('(').next().unwrap_or_default().trim().to_string()
        })
        .collect())
}

/// Load a saved detail batch. Accepts a JSON array or back-to-back JSON objects.
pub fn load_detail_batch(path: impl AsRef<Path>) -> Result<Vec<RawDetailRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut records = Vec::new();
    for value in serde_json::Deserializer::from_str(&data).into_iter::<JsonValue>() {
        match value.with_context(|| format!("parsing {}", path.display()))? {
            JsonValue::Array(items) => records.extend(items.into_iter().map(RawDetailRecord::new)),
            other => records.push(RawDetailRecord::new(other)),
        }
    }
    Ok(records)
}
