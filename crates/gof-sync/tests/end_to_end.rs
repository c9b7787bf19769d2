use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use gof_core::RawDetailRecord;
use gof_index::{EmbeddingProvider, FakeEmbeddings, IndexConfig, ProviderKind};
use gof_sync::{
    normalize, read_composed, run_sync_once, write_rows, RowSchema, SyncConfig, SyncPipeline,
};
use serde_json::json;
use wiremock::matchers::{body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(api_base: String, root: &Path) -> SyncConfig {
    SyncConfig {
        data_dir: root.join("synopsis"),
        artifacts_dir: root.join("artifacts"),
        api_base,
        search_page_url: "http://127.0.0.1:9/search-grants".to_string(),
        origin: "https://grants.gov".to_string(),
        user_agent: "gof-test".to_string(),
        http_timeout_secs: 5,
        fetch_concurrency: 2,
        listing_rows: 50,
        listing_date_range: "3".to_string(),
        fields_file: None,
        index: IndexConfig::default(),
    }
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
}

fn data_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

#[test]
fn synopsis_and_forecast_records_produce_expected_csv() {
    let dir = tempfile::tempdir().unwrap();
    let records = vec![
        RawDetailRecord::new(json!({
            "synopsis": {
                "opportunityId": "100",
                "synopsisDesc": "Fund research",
                "applicantEligibilityDesc": "Nonprofits only",
                "applicantTypes": [{"description": "Nonprofit"}]
            }
        })),
        RawDetailRecord::new(json!({
            "forecast": {
                "opportunityId": "200",
                "synopsisDesc": "Upcoming grant",
                "applicantEligibilityDesc": "",
                "applicantTypes": []
            }
        })),
    ];
    let report = normalize(&records);
    let path = dir.path().join("2024-01-15.csv");
    write_rows(&report.rows, &RowSchema::core(), &path).unwrap();

    assert_eq!(
        data_lines(&path),
        vec![
            r#"100,"Fund research","Nonprofits only","Nonprofit""#,
            r#"200,"Upcoming grant","","""#,
        ]
    );
}

#[tokio::test]
async fn pipeline_isolates_detail_failures_and_reuses_the_index() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/opportunities/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "oppHits": [{"id": "100"}, {"id": "200"}, {"id": "300"}, {"id": "100"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/opportunity/details"))
        .and(body_string("oppId=100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 100,
            "synopsis": {
                "opportunityId": 100,
                "synopsisDesc": "Fund research",
                "applicantEligibilityDesc": "Nonprofits only",
                "applicantTypes": [{"description": "Nonprofit"}]
            },
            "forecast": null
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/opportunity/details"))
        .and(body_string("oppId=200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 200,
            "forecast": {"opportunityId": 200, "forecastDesc": "Upcoming grant"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/opportunity/details"))
        .and(body_string("oppId=300"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let pipeline = SyncPipeline::new(config(server.uri(), root.path())).unwrap();
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(FakeEmbeddings::new(32).unwrap());

    let first = pipeline.run_once(date(), provider.clone()).await.unwrap();
    let summary = &first.summary;
    assert_eq!(summary.listed, 4);
    assert_eq!(summary.duplicates_dropped, 1);
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].opportunity_id, "300");
    assert_eq!(summary.rows_written, 2);
    assert!(!summary.index_reused);
    assert_eq!(summary.indexed_chunks, 2);

    let layout = pipeline.layout();
    assert_eq!(
        data_lines(&layout.normalized_csv(date())),
        vec![
            r#"100,"Fund research","Nonprofits only","Nonprofit""#,
            r#"200,"Upcoming grant","","""#,
        ]
    );
    let combined = read_composed(&layout.combined_csv(date())).unwrap();
    assert_eq!(
        combined[0].description,
        "Synopsis Description: Fund research. Applicant Eligibility Description: Nonprofits only. Applicant Types: Nonprofit"
    );
    assert!(layout.details_json(date()).exists());
    assert!(Path::new(&summary.report_path).exists());

    let hits = first.index.query(&first.index.chunks()[0].text, 1).await.unwrap();
    assert_eq!(hits[0].chunk.provenance.opportunity_id, "100");

    let second = pipeline.run_once(date(), provider).await.unwrap();
    assert!(second.summary.index_reused);
    assert_eq!(second.summary.indexed_chunks, 2);
}

#[tokio::test]
async fn listing_failure_aborts_before_any_artifact_is_written() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/opportunities/search"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let pipeline = SyncPipeline::new(config(server.uri(), root.path())).unwrap();
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(FakeEmbeddings::new(8).unwrap());

    assert!(pipeline.run_once(date(), provider).await.is_err());
    assert!(!pipeline.layout().normalized_csv(date()).exists());
    assert!(!pipeline.layout().index_dir(date()).exists());
}

#[tokio::test]
async fn run_sync_once_uses_the_configured_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/opportunities/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"oppHits": [{"id": 7}]})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/opportunity/details"))
        .and(body_string("oppId=7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "synopsis": {"opportunityId": 7, "synopsisDesc": "Rural broadband"}
        })))
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let mut config = config(server.uri(), root.path());
    config.index.provider = ProviderKind::Fake;
    config.index.fake_dimensions = 16;

    let outcome = run_sync_once(config, date()).await.unwrap();
    assert_eq!(outcome.summary.rows_written, 1);
    assert_eq!(outcome.summary.indexed_chunks, 1);
    assert_eq!(outcome.index.chunks()[0].embedding.len(), 16);
}

#[tokio::test]
async fn run_sync_once_rejects_missing_openai_key_before_listing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/opportunities/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"oppHits": []})))
        .expect(0)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().unwrap();
    let mut config = config(server.uri(), root.path());
    config.index.provider = ProviderKind::OpenAi;
    config.index.openai_api_key = None;

    let err = run_sync_once(config, date()).await.err().expect("configuration error");
    assert!(err.to_string().contains("OPENAI_API_KEY"), "got {err}");
}
