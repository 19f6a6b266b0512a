use std::time::Duration;

use integobase_adapters::{FreshserviceClient, FreshserviceConfig, Pager, SourceClient, SourceError};
use integobase_core::EntityKind;
use integobase_storage::{BackoffPolicy, HttpClientConfig};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> FreshserviceClient {
    let config = FreshserviceConfig::for_domain(&server.uri(), "api-key");
    let http = HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        token_bucket: None,
        ..Default::default()
    };
    FreshserviceClient::new(config, http).unwrap()
}

async fn mount_page(server: &MockServer, route: &str, page: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(query_param("page", page))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn departments_paginate_until_empty_page() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/api/v2/departments",
        "1",
        json!({"departments": [{"id": 1, "name": "Acme"}, {"id": 2, "name": "Globex"}]}),
    )
    .await;
    mount_page(
        &server,
        "/api/v2/departments",
        "2",
        json!({"departments": [{"id": 3, "name": "Initech"}]}),
    )
    .await;
    mount_page(&server, "/api/v2/departments", "3", json!({"departments": []})).await;

    let client = client_for(&server);
    let mut pager = Pager::new(&client, EntityKind::Client, None);
    let mut ids = Vec::new();
    while let Some(page) = pager.next_page().await.unwrap() {
        ids.extend(page.records.into_iter().filter_map(|r| r.source_id));
    }

    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(pager.pages_fetched(), 3);
}

#[tokio::test]
async fn tickets_are_enriched_with_time_entries() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/api/v2/tickets/filter",
        "1",
        json!({"tickets": [
            {"id": 501, "subject": "Printer", "department_id": 1, "status": 5,
             "updated_at": "2025-02-01T10:00:00Z"},
            {"id": 502, "subject": "VPN", "department_id": 1, "status": 5,
             "updated_at": "2025-02-02T10:00:00Z"}
        ]}),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets/501/time_entries"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "time_entries": [{"time_spent": "01:30"}, {"time_spent": "00:15:00"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/tickets/502/time_entries"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.incremental(EntityKind::Ticket));
    let page = client.fetch_page(EntityKind::Ticket, None, None).await.unwrap();

    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].payload["time_entries"].as_array().unwrap().len(), 2);
    assert_eq!(page.records[1].payload["time_entries"], json!([]));
    assert!(page.records[0].modified_at.is_some());
    assert_eq!(page.next.as_ref().map(|t| t.as_str()), Some("2"));
}

#[tokio::test]
async fn rejected_key_is_an_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/requesters"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.fetch_page(EntityKind::Contact, None, None).await.unwrap_err();
    assert!(err.is_auth());
}

#[tokio::test]
async fn missing_collection_is_an_empty_terminal_page() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    let page = client.fetch_page(EntityKind::Client, None, None).await.unwrap();
    assert!(page.records.is_empty());
    assert!(page.is_last());
}

#[tokio::test]
async fn persistent_outage_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/departments"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.fetch_page(EntityKind::Client, None, None).await.unwrap_err();
    assert!(matches!(err, SourceError::Unavailable { attempts: 2, .. }));
}

#[tokio::test]
async fn rmm_kinds_are_unsupported() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    assert!(!client.supports(EntityKind::Asset));
    let err = client.fetch_page(EntityKind::Asset, None, None).await.unwrap_err();
    assert!(matches!(err, SourceError::Unsupported { .. }));
}
