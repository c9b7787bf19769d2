use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use gof_core::{ComposedRow, GrantsError};
use gof_index::{
    EmbeddingProvider, FakeEmbeddings, IndexBuilder, OpenAiEmbeddings, TeiEmbeddings,
};
use gof_storage::ArtifactLayout;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct CountingProvider {
    inner: FakeEmbeddings,
    document_calls: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Self {
        Self {
            inner: FakeEmbeddings::new(16).unwrap(),
            document_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, GrantsError> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed_documents(texts).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, GrantsError> {
        self.inner.embed_query(text).await
    }
}

fn rows() -> Vec<ComposedRow> {
    vec![
        ComposedRow {
            opportunity_id: "100".into(),
            description: "Synopsis Description: Fund research. Applicant Eligibility Description: Nonprofits only. Applicant Types: Nonprofit".into(),
        },
        ComposedRow {
            opportunity_id: "200".into(),
            description: "Synopsis Description: Upcoming grant. Applicant Eligibility Description: . Applicant Types:".into(),
        },
    ]
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

#[tokio::test]
async fn second_call_for_same_date_loads_without_embedding() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let provider = Arc::new(CountingProvider::new());
    let builder = IndexBuilder::new(provider.clone());

    let first = builder
        .build_or_load(&rows(), "combined.csv", &layout, date())
        .await
        .expect("first build");
    assert!(!first.reused());
    assert_eq!(first.chunks().len(), 2);
    assert!(layout.index_dir(date()).join("index.json").exists());

    let second = builder
        .build_or_load(&rows(), "combined.csv", &layout, date())
        .await
        .expect("second load");
    assert!(second.reused());
    let provenance = |chunks: &[gof_core::IndexedChunk]| {
        chunks.iter().map(|c| c.provenance.clone()).collect::<Vec<_>>()
    };
    assert_eq!(provenance(second.chunks()), provenance(first.chunks()));
    assert_eq!(provider.document_calls.load(Ordering::SeqCst), 1);

    let other_day = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
    builder
        .build_or_load(&rows(), "combined.csv", &layout, other_day)
        .await
        .expect("new date builds");
    assert_eq!(provider.document_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn query_returns_the_matching_chunk_first() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let builder = IndexBuilder::new(Arc::new(FakeEmbeddings::new(64).unwrap()));
    let index = builder
        .build_or_load(&rows(), "combined.csv", &layout, date())
        .await
        .unwrap();

    // Fake vectors only match identical text, so query with a stored chunk verbatim.
    let target = index.chunks()[1].text.clone();
    let hits = index.query(&target, 4).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk.provenance.opportunity_id, "200");
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    assert!(hits[0].score >= hits[1].score);

    let top_one = index.query(&target, 1).await.unwrap();
    assert_eq!(top_one.len(), 1);
}

#[tokio::test]
async fn loading_with_a_different_provider_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    IndexBuilder::new(Arc::new(FakeEmbeddings::new(8).unwrap()))
        .build_or_load(&rows(), "combined.csv", &layout, date())
        .await
        .unwrap();

    let err = IndexBuilder::new(Arc::new(FakeEmbeddings::new(9).unwrap()))
        .load(&layout, date())
        .await
        .err()
        .expect("mismatch");
    assert!(matches!(err, GrantsError::Configuration(_)));
}

#[tokio::test]
async fn loading_a_missing_index_names_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path());
    let err = IndexBuilder::new(Arc::new(FakeEmbeddings::new(8).unwrap()))
        .load(&layout, date())
        .await
        .err()
        .expect("missing");
    assert!(err.to_string().contains("2024-01-15_db"));
}

#[tokio::test]
async fn tei_provider_posts_inputs_to_embed_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([[0.1, 0.2], [0.3, 0.4]])))
        .mount(&server)
        .await;

    let tei = TeiEmbeddings::new(&server.uri(), "all-MiniLM-L6-v2", Duration::from_secs(5)).unwrap();
    let vectors = tei.embed_documents(&["a", "b"]).await.unwrap();
    assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    assert_eq!(tei.name(), "huggingface/all-MiniLM-L6-v2");
}

#[tokio::test]
async fn tei_count_mismatch_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([[0.1, 0.2]])))
        .mount(&server)
        .await;

    let tei = TeiEmbeddings::new(&server.uri(), "all-MiniLM-L6-v2", Duration::from_secs(5)).unwrap();
    assert!(tei.embed_documents(&["a", "b"]).await.is_err());
}

#[tokio::test]
async fn openai_provider_sends_bearer_and_orders_by_index() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        })))
        .mount(&server)
        .await;

    let openai = OpenAiEmbeddings::new(
        "sk-test",
        &format!("{}/v1", server.uri()),
        "text-embedding-ada-002",
        Duration::from_secs(5),
    )
    .unwrap();
    let vectors = openai.embed_documents(&["first", "second"]).await.unwrap();
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}
