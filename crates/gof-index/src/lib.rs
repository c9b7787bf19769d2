//! Embedding providers, chunking and the dated similarity index for GOF.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gof_core::{ChunkProvenance, ComposedRow, GrantsError, IndexedChunk, Stage};
use gof_storage::ArtifactLayout;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use text_splitter::{ChunkConfig, TextSplitter};
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gof-index";

pub const INDEX_FILE_NAME: &str = "index.json";
pub const INDEX_FORMAT_VERSION: u32 = 1;

pub const DEFAULT_HF_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Maximum number of texts per embedding request.
const TEI_BATCH_SIZE: usize = 64;
const OPENAI_BATCH_SIZE: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    HuggingFace,
    OpenAi,
    Fake,
}

impl FromStr for ProviderKind {
    type Err = GrantsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "huggingface" | "hf" => Ok(Self::HuggingFace),
            "openai" => Ok(Self::OpenAi),
            "fake" | "deterministic-fake" => Ok(Self::Fake),
            other => Err(GrantsError::Configuration(format!(
                "unknown embedding provider {other:?} (expected huggingface, openai or fake)"
            ))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::HuggingFace => "huggingface",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Fake => "fake",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSettings {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub provider: ProviderKind,
    pub tei_url: String,
    pub hf_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub fake_dimensions: usize,
    pub chunk: ChunkSettings,
    pub top_k: usize,
    pub http_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::HuggingFace,
            tei_url: "http://localhost:8080".to_string(),
            hf_model: DEFAULT_HF_MODEL.to_string(),
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            fake_dimensions: 1352,
            chunk: ChunkSettings::default(),
            top_k: 4,
            http_timeout_secs: 60,
        }
    }
}

impl IndexConfig {
    /// `provider` wins over `EMBEDDING_PROVIDER`, which is then not parsed at all.
    pub fn from_env(provider: Option<ProviderKind>) -> Result<Self, GrantsError> {
        let defaults = Self::default();
        let provider = match (provider, std::env::var("EMBEDDING_PROVIDER")) {
            (Some(kind), _) => kind,
            (None, Ok(value)) => value.parse()?,
            (None, Err(_)) => defaults.provider,
        };
        let parse_usize = |key: &str, fallback: usize| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };
        Ok(Self {
            provider,
            tei_url: std::env::var("GOF_TEI_URL").unwrap_or(defaults.tei_url),
            hf_model: std::env::var("GOF_HF_MODEL").unwrap_or(defaults.hf_model),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            openai_model: std::env::var("OPENAI_EMBEDDING_MODEL")
                .unwrap_or(defaults.openai_model),
            fake_dimensions: parse_usize("GOF_FAKE_DIMENSIONS", defaults.fake_dimensions),
            chunk: ChunkSettings {
                size: parse_usize("GOF_CHUNK_SIZE", defaults.chunk.size),
                overlap: parse_usize("GOF_CHUNK_OVERLAP", defaults.chunk.overlap),
            },
            top_k: parse_usize("GOF_TOP_K", defaults.top_k),
            http_timeout_secs: std::env::var("GOF_EMBED_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
        })
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider + model identity, persisted alongside the index.
    fn name(&self) -> String;

    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, GrantsError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, GrantsError>;
}

/// Select a provider. Credentials are checked here, before any network work.
pub fn provider_from_config(config: &IndexConfig) -> Result<Arc<dyn EmbeddingProvider>, GrantsError> {
    let timeout = Duration::from_secs(config.http_timeout_secs);
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        ProviderKind::HuggingFace => Arc::new(TeiEmbeddings::new(
            &config.tei_url,
            &config.hf_model,
            timeout,
        )?),
        ProviderKind::OpenAi => {
            let key = config.openai_api_key.as_deref().unwrap_or_default();
            Arc::new(OpenAiEmbeddings::new(
                key,
                &config.openai_base_url,
                &config.openai_model,
                timeout,
            )?)
        }
        ProviderKind::Fake => Arc::new(FakeEmbeddings::new(config.fake_dimensions)?),
    };
    Ok(provider)
}

/// Fixed-dimension placeholder vectors derived from a SHA-256 of the text.
#[derive(Debug, Clone)]
pub struct FakeEmbeddings {
    dimensions: usize,
}

impl FakeEmbeddings {
    pub fn new(dimensions: usize) -> Result<Self, GrantsError> {
        if dimensions == 0 {
            return Err(GrantsError::Configuration(
                "fake embedding dimensions must be positive".to_string(),
            ));
        }
        Ok(Self { dimensions })
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimensions);
        let mut block = 0u64;
        while out.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(block.to_le_bytes());
            let digest = hasher.finalize();
            for word in digest.chunks_exact(4) {
                if out.len() == self.dimensions {
                    break;
                }
                let raw = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                out.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
            }
            block += 1;
        }
        normalize(&mut out);
        out
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbeddings {
    fn name(&self) -> String {
        format!("fake/{}", self.dimensions)
    }

    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, GrantsError> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, GrantsError> {
        Ok(self.vector(text))
    }
}

/// Local sentence-transformer model served by Text Embeddings Inference.
pub struct TeiEmbeddings {
    client: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct TeiRequest<'a> {
    inputs: &'a [&'a str],
}

impl TeiEmbeddings {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, GrantsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GrantsError::Configuration(format!("building TEI client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}/embed", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    async fn embed_batches(&self, stage: Stage, texts: &[&str]) -> Result<Vec<Vec<f32>>, GrantsError> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(TEI_BATCH_SIZE) {
            let resp = self
                .client
                .post(&self.url)
                .json(&TeiRequest { inputs: chunk })
                .send()
                .await
                .map_err(|e| GrantsError::remote(stage, format!("TEI request failed: {e}")))?;
            if !resp.status().is_success() {
                return Err(GrantsError::remote(
                    stage,
                    format!("TEI returned status {}", resp.status()),
                ));
            }
            let embeddings: Vec<Vec<f32>> = resp
                .json()
                .await
                .map_err(|e| GrantsError::remote(stage, format!("TEI response parse error: {e}")))?;
            if embeddings.len() != chunk.len() {
                return Err(GrantsError::remote(
                    stage,
                    format!(
                        "TEI returned {} embeddings for {} inputs",
                        embeddings.len(),
                        chunk.len()
                    ),
                ));
            }
            all.extend(embeddings);
        }
        Ok(all)
    }
}

#[async_trait]
impl EmbeddingProvider for TeiEmbeddings {
    fn name(&self) -> String {
        format!("huggingface/{}", self.model)
    }

    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, GrantsError> {
        self.embed_batches(Stage::Index, texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, GrantsError> {
        let mut out = self.embed_batches(Stage::Query, &[text]).await?;
        out.pop()
            .ok_or_else(|| GrantsError::remote(Stage::Query, "TEI returned no embedding"))
    }
}

/// Remote embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, GrantsError> {
        if api_key.trim().is_empty() {
            return Err(GrantsError::Configuration(
                "the openai embedding provider requires OPENAI_API_KEY".to_string(),
            ));
        }
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| GrantsError::Configuration("invalid OpenAI API key".to_string()))?;
        headers.insert(AUTHORIZATION, auth);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| GrantsError::Configuration(format!("building OpenAI client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    async fn embed_batches(&self, stage: Stage, texts: &[&str]) -> Result<Vec<Vec<f32>>, GrantsError> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(OPENAI_BATCH_SIZE) {
            let resp = self
                .client
                .post(&self.endpoint)
                .json(&OpenAiRequest {
                    model: &self.model,
                    input: chunk,
                })
                .send()
                .await
                .map_err(|e| GrantsError::remote(stage, format!("OpenAI request failed: {e}")))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(GrantsError::remote(
                    stage,
                    format!("OpenAI embeddings request failed ({status}): {body}"),
                ));
            }
            let mut parsed: OpenAiResponse = resp.json().await.map_err(|e| {
                GrantsError::remote(stage, format!("OpenAI response parse error: {e}"))
            })?;
            parsed.data.sort_by_key(|entry| entry.index);
            if parsed.data.len() != chunk.len() {
                return Err(GrantsError::remote(
                    stage,
                    format!(
                        "OpenAI returned {} embeddings for {} inputs",
                        parsed.data.len(),
                        chunk.len()
                    ),
                ));
            }
            all.extend(parsed.data.into_iter().map(|entry| entry.embedding));
        }
        Ok(all)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn name(&self) -> String {
        format!("openai/{}", self.model)
    }

    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, GrantsError> {
        self.embed_batches(Stage::Index, texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, GrantsError> {
        let mut out = self.embed_batches(Stage::Query, &[text]).await?;
        out.pop()
            .ok_or_else(|| GrantsError::remote(Stage::Query, "OpenAI returned no embedding"))
    }
}

/// One loader document: a combined CSV row rendered as `column: value` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub provenance: ChunkProvenance,
    pub text: String,
}

pub fn documents_from_rows(rows: &[ComposedRow], source: &str) -> Vec<Document> {
    rows.iter()
        .enumerate()
        .map(|(row, composed)| Document {
            provenance: ChunkProvenance {
                opportunity_id: composed.opportunity_id.clone(),
                source: source.to_string(),
                row,
            },
            text: format!(
                "opportunity_id: {}\ndescription: {}",
                composed.opportunity_id, composed.description
            ),
        })
        .collect()
}

pub fn split_documents(
    documents: &[Document],
    settings: ChunkSettings,
) -> Result<Vec<Document>, GrantsError> {
    if settings.size == 0 {
        return Err(GrantsError::Configuration(
            "chunk size must be positive".to_string(),
        ));
    }
    let config = ChunkConfig::new(settings.size)
        .with_overlap(settings.overlap)
        .map_err(|e| GrantsError::Configuration(format!("invalid chunk settings: {e}")))?;
    let splitter = TextSplitter::new(config);
    Ok(documents
        .iter()
        .flat_map(|doc| {
            splitter.chunks(&doc.text).map(|chunk| Document {
                provenance: doc.provenance.clone(),
                text: chunk.to_string(),
            })
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub format_version: u32,
    pub provider: String,
    pub dimensions: usize,
    pub chunk: ChunkSettings,
    pub created_at: DateTime<Utc>,
    pub chunks: Vec<IndexedChunk>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: IndexedChunk,
    pub score: f32,
}

pub struct IndexHandle {
    dir: PathBuf,
    index: PersistedIndex,
    provider: Arc<dyn EmbeddingProvider>,
    reused: bool,
}

impl IndexHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunks(&self) -> &[IndexedChunk] {
        &self.index.chunks
    }

    /// True when the index was loaded from disk instead of embedded this call.
    pub fn reused(&self) -> bool {
        self.reused
    }

    /// Nearest chunks first by cosine similarity. Ties have no stable order.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredChunk>, GrantsError> {
        if self.index.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query = self.provider.embed_query(text).await?;
        if query.len() != self.index.dimensions {
            return Err(GrantsError::remote(
                Stage::Query,
                format!(
                    "query embedding has {} dimensions, index has {}",
                    query.len(),
                    self.index.dimensions
                ),
            ));
        }

        let mut scored: Vec<ScoredChunk> = self
            .index
            .chunks
            .iter()
            .map(|chunk| ScoredChunk {
                score: cosine_similarity(&query, &chunk.embedding),
                chunk: chunk.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }
}

pub struct IndexBuilder {
    provider: Arc<dyn EmbeddingProvider>,
    settings: ChunkSettings,
}

impl IndexBuilder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            settings: ChunkSettings::default(),
        }
    }

    pub fn with_chunk_settings(mut self, settings: ChunkSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Load the index persisted for `date`, or chunk, embed and persist `rows`.
    pub async fn build_or_load(
        &self,
        rows: &[ComposedRow],
        source: &str,
        layout: &ArtifactLayout,
        date: NaiveDate,
    ) -> Result<IndexHandle, GrantsError> {
        let dir = layout.index_dir(date);
        if let Some(handle) = self.try_load(&dir).await? {
            info!(dir = %dir.display(), chunks = handle.chunks().len(), "reusing persisted index");
            return Ok(handle);
        }

        let documents = documents_from_rows(rows, source);
        let pieces = split_documents(&documents, self.settings)?;
        info!(
            provider = %self.provider.name(),
            documents = documents.len(),
            chunks = pieces.len(),
            "building index"
        );

        let texts: Vec<&str> = pieces.iter().map(|p| p.text.as_str()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            self.provider.embed_documents(&texts).await?
        };
        if embeddings.len() != pieces.len() {
            return Err(GrantsError::remote(
                Stage::Index,
                format!(
                    "provider returned {} embeddings for {} chunks",
                    embeddings.len(),
                    pieces.len()
                ),
            ));
        }
        let dimensions = embeddings.first().map(Vec::len).unwrap_or_default();
        if embeddings.iter().any(|e| e.len() != dimensions) {
            return Err(GrantsError::remote(
                Stage::Index,
                "provider returned embeddings of mixed dimensions",
            ));
        }

        let index = PersistedIndex {
            format_version: INDEX_FORMAT_VERSION,
            provider: self.provider.name(),
            dimensions,
            chunk: self.settings,
            created_at: Utc::now(),
            chunks: pieces
                .into_iter()
                .zip(embeddings)
                .map(|(piece, embedding)| IndexedChunk {
                    provenance: piece.provenance,
                    text: piece.text,
                    embedding,
                })
                .collect(),
        };
        persist(&dir, &index).await?;

        Ok(IndexHandle {
            dir,
            index,
            provider: Arc::clone(&self.provider),
            reused: false,
        })
    }

    /// Load the index persisted for `date`; missing is an error.
    pub async fn load(&self, layout: &ArtifactLayout, date: NaiveDate) -> Result<IndexHandle, GrantsError> {
        let dir = layout.index_dir(date);
        self.try_load(&dir).await?.ok_or_else(|| {
            GrantsError::artifact(Stage::Query, &dir, "no index has been built for this date")
        })
    }

    async fn try_load(&self, dir: &Path) -> Result<Option<IndexHandle>, GrantsError> {
        let path = dir.join(INDEX_FILE_NAME);
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| GrantsError::artifact(Stage::Index, &path, e))?;
        if !exists {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|e| GrantsError::artifact(Stage::Index, &path, e))?;
        let index: PersistedIndex = serde_json::from_slice(&bytes)
            .map_err(|e| GrantsError::artifact(Stage::Index, &path, e))?;
        let requested = self.provider.name();
        if index.provider != requested {
            return Err(GrantsError::Configuration(format!(
                "index at {} was built with {}, not {requested}",
                dir.display(),
                index.provider
            )));
        }
        Ok(Some(IndexHandle {
            dir: dir.to_path_buf(),
            index,
            provider: Arc::clone(&self.provider),
            reused: true,
        }))
    }
}

async fn persist(dir: &Path, index: &PersistedIndex) -> Result<(), GrantsError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| GrantsError::artifact(Stage::Index, dir, e))?;
    let bytes =
        serde_json::to_vec(index).map_err(|e| GrantsError::artifact(Stage::Index, dir, e))?;
    let path = dir.join(INDEX_FILE_NAME);
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| GrantsError::artifact(Stage::Index, &temp_path, e))?;
    if let Err(e) = fs::rename(&temp_path, &path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(GrantsError::artifact(Stage::Index, &path, e));
    }
    debug!(path = %path.display(), bytes = bytes.len(), "index persisted");
    Ok(())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}
