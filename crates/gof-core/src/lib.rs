//! Core domain model, error taxonomy and date keys for GOF.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "gof-core";

/// Header of the normalized CSV, in column order. Extended columns follow these.
pub const CORE_COLUMNS: [&str; 4] = [
    "opportunity_id",
    "description",
    "applicant_eligibility_desc",
    "applicant_types",
];

/// Header of the combined (id, description) CSV.
pub const COMBINED_COLUMNS: [&str; 2] = ["opportunity_id", "description"];

/// Artifact date key, `YYYY-MM-DD`.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date_key(input: &str) -> Result<NaiveDate, GrantsError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| GrantsError::Configuration(format!("invalid date {input:?}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Listing,
    Detail,
    Eligibility,
    Normalize,
    Write,
    Compose,
    Index,
    Query,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Listing => "listing",
            Stage::Detail => "detail",
            Stage::Eligibility => "eligibility",
            Stage::Normalize => "normalize",
            Stage::Write => "write",
            Stage::Compose => "compose",
            Stage::Index => "index",
            Stage::Query => "query",
        };
        f.write_str(name)
    }
}

fn id_suffix(id: &Option<String>) -> String {
    id.as_deref()
        .map(|id| format!(" (opportunity {id})"))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum GrantsError {
    #[error("{stage} stage failed{}: {message}", id_suffix(.opportunity_id))]
    RemoteService {
        stage: Stage,
        opportunity_id: Option<String>,
        message: String,
    },
    #[error("malformed record #{index}: {reason}")]
    MalformedRecord { index: usize, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{stage} stage artifact error at {}: {message}", .path.display())]
    ArtifactIo {
        stage: Stage,
        path: PathBuf,
        message: String,
    },
}

impl GrantsError {
    pub fn remote(stage: Stage, message: impl Into<String>) -> Self {
        Self::RemoteService {
            stage,
            opportunity_id: None,
            message: message.into(),
        }
    }

    pub fn remote_for(stage: Stage, opportunity_id: &str, message: impl Into<String>) -> Self {
        Self::RemoteService {
            stage,
            opportunity_id: Some(opportunity_id.to_string()),
            message: message.into(),
        }
    }

    pub fn artifact(stage: Stage, path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::ArtifactIo {
            stage,
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Accepts `"350938"` and `350938` alike.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Minimal listing entry returned by the bulk search endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunitySummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub agency_code: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub open_date: Option<String>,
    #[serde(default)]
    pub close_date: Option<String>,
    #[serde(default)]
    pub opp_status: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
}

impl OpportunitySummary {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            number: None,
            title: None,
            agency_code: None,
            agency: None,
            open_date: None,
            close_date: None,
            opp_status: None,
            doc_type: None,
        }
    }
}

/// Detail payload passed through from the detail endpoint without validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawDetailRecord(pub JsonValue);

impl RawDetailRecord {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_object(&self) -> Option<&Map<String, JsonValue>> {
        self.0.as_object()
    }

    pub fn synopsis(&self) -> Option<&JsonValue> {
        self.0.get("synopsis").filter(|v| !v.is_null())
    }

    pub fn forecast(&self) -> Option<&JsonValue> {
        self.0.get("forecast").filter(|v| !v.is_null())
    }

    /// Best-effort id for log lines; the normalizer does its own extraction.
    pub fn opportunity_id_hint(&self) -> Option<String> {
        [self.0.get("id"), self.synopsis(), self.forecast()]
            .into_iter()
            .flatten()
            .find_map(|v| match v {
                JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                JsonValue::Object(map) => match map.get("opportunityId") {
                    Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
                    Some(JsonValue::Number(n)) => Some(n.to_string()),
                    _ => None,
                },
                _ => None,
            })
    }
}

/// One flat row per opportunity, stable regardless of synopsis/forecast origin.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub opportunity_id: String,
    pub description: String,
    pub applicant_eligibility_desc: String,
    pub applicant_types: String,
    /// Configured extended columns, keyed by column name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl NormalizedRow {
    pub fn core_values(&self) -> [&str; 4] {
        [
            &self.opportunity_id,
            &self.description,
            &self.applicant_eligibility_desc,
            &self.applicant_types,
        ]
    }
}

/// Retrieval-oriented (id, description) pair emitted by the composer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedRow {
    pub opportunity_id: String,
    pub description: String,
}

/// Where a chunk came from: the combined CSV path and its data-row number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProvenance {
    pub opportunity_id: String,
    pub source: String,
    pub row: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub provenance: ChunkProvenance,
    pub text: String,
    pub embedding: Vec<f32>,
}
