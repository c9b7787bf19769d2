use gof_adapters::{
    extract_eligibilities, AdapterContext, GrantsGovAdapter, ListingQuery, OpportunitySource,
};
use gof_core::{GrantsError, Stage};
use gof_storage::{ArtifactStore, HttpClientConfig, HttpFetcher};
use serde_json::json;
use wiremock::matchers::{body_json, body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig::default()).expect("http fetcher")
}

#[tokio::test]
async fn lists_then_fetches_details_through_the_rest_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/grantsws/rest/opportunities/search"))
        .and(body_json(json!({
            "keyword": null,
            "oppNum": null,
            "cfda": null,
            "agencies": null,
            "sortBy": "openDate|desc",
            "rows": 25,
            "eligibilities": null,
            "fundingCategories": null,
            "fundingInstruments": null,
            "dateRange": "3",
            "oppStatuses": "forecasted|posted",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "oppHits": [{"id": "100", "title": "Fund research"}, {"id": "200"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/grantsws/rest/opportunity/details"))
        .and(body_string("oppId=100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 100,
            "synopsis": {"opportunityId": 100, "synopsisDesc": "Fund research"}
        })))
        .mount(&server)
        .await;

    let http = fetcher();
    let artifacts = tempfile::tempdir().unwrap();
    let adapter = GrantsGovAdapter::new(&http, format!("{}/grantsws/rest/", server.uri()))
        .with_query(ListingQuery {
            rows: 25,
            ..Default::default()
        })
        .with_artifact_store(ArtifactStore::new(artifacts.path()));
    let ctx = AdapterContext::new();

    let hits = adapter.list_opportunities(&ctx).await.expect("listing");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].title.as_deref(), Some("Fund research"));

    let detail = adapter.fetch_detail(&ctx, "100").await.expect("detail");
    assert_eq!(detail.synopsis().unwrap()["synopsisDesc"], "Fund research");

    let stored = std::fs::read_dir(artifacts.path()).unwrap().count();
    assert_eq!(stored, 1, "one dated directory of raw payloads");
}

#[tokio::test]
async fn listing_failure_status_is_fatal_remote_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/opportunities/search"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let http = fetcher();
    let adapter = GrantsGovAdapter::new(&http, server.uri());
    let err = adapter
        .list_opportunities(&AdapterContext::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GrantsError::RemoteService {
            stage: Stage::Listing,
            opportunity_id: None,
            ..
        }
    ));
}

#[tokio::test]
async fn detail_failure_names_the_opportunity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/opportunity/details"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let http = fetcher();
    let adapter = GrantsGovAdapter::new(&http, server.uri());
    let err = adapter
        .fetch_detail(&AdapterContext::new(), "350938")
        .await
        .unwrap_err();
    match err {
        GrantsError::RemoteService {
            stage,
            opportunity_id,
            ..
        } => {
            assert_eq!(stage, Stage::Detail);
            assert_eq!(opportunity_id.as_deref(), Some("350938"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn eligibility_extractor_reads_search_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search-grants"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><div id="m-a2">
                 <label class="usa-checkbox__label margin-top-1">Small businesses (412)</label>
                 <label class="usa-checkbox__label margin-top-1">Individuals (35)</label>
               </div></body></html>"#,
        ))
        .mount(&server)
        .await;

    let http = fetcher();
    let labels = extract_eligibilities(&http, &format!("{}/search-grants", server.uri()))
        .await
        .expect("eligibilities");
    assert_eq!(labels, vec!["Small businesses", "Individuals"]);
}
