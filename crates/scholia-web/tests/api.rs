//! API tests against a live server bound to an ephemeral port. The
//! dispatcher carries no remote providers, so search resolves only
//! harvested sources and never leaves the machine.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scholia_common::AppConfig;
use scholia_db::{Database, MetadataRecord, MetadataRecordRepository, RecordAuthor};
use scholia_search::SearchDispatcher;
use scholia_web::router::build_router;
use scholia_web::state::AppState;

struct TestServer {
    base: String,
    db: Database,
    client: reqwest::Client,
}

async fn spawn_server() -> TestServer {
    let config = AppConfig::default();
    let db = Database::in_memory().await.unwrap();
    db.initialize().await.unwrap();

    let dispatcher = SearchDispatcher::new(db.clone(), Duration::from_secs(5));
    let scheduler = scholia_web::build_scheduler(&config, db.clone());
    let app = build_router(AppState::new(config, db.clone(), dispatcher, scheduler));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        db,
        client: reqwest::Client::new(),
    }
}

async fn seed_record(db: &Database, id: &str, title: &str) {
    MetadataRecordRepository::new(db.clone())
        .upsert(&MetadataRecord {
            provider: "repo-a".to_string(),
            record_id: id.to_string(),
            title: title.to_string(),
            authors: vec![RecordAuthor {
                name: "Ada Lovelace".to_string(),
                affiliation: None,
            }],
            abstract_text: None,
            published: None,
            doi: None,
            url: None,
            keywords: vec![],
            harvested_at: Utc::now(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn search_requires_a_query_term() {
    let server = spawn_server().await;

    let resp = server
        .client
        .get(format!("{}/search", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("q"));
}

#[tokio::test]
async fn search_returns_merged_page() {
    let server = spawn_server().await;

    // An active harvest source makes the harvested store searchable.
    let resp = server
        .client
        .post(format!("{}/harvest/sources", server.base))
        .json(&serde_json::json!({
            "name": "local-repo",
            "endpoint_url": "https://repo.example.org/oai"
        }))
        .send()
        .await
        .unwrap();
    let created: serde_json::Value = resp.json().await.unwrap();
    let source_id = created["id"].as_str().unwrap().to_string();

    seed_record(&server.db, "1", "Analytical engines revisited").await;
    seed_record(&server.db, "2", "Unrelated work").await;

    let resp = server
        .client
        .get(format!("{}/search?q=analytical", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["total_results"], 1);
    assert_eq!(body["total_pages"], 1);
    assert_eq!(body["sources_searched"], serde_json::json!([source_id]));
    assert_eq!(body["results"][0]["title"], "Analytical engines revisited");
    assert_eq!(body["results"][0]["source"], "local-repo");
    assert!(body["errors"].as_array().unwrap().is_empty());

    // The same source is addressable directly by its id.
    let resp = server
        .client
        .get(format!(
            "{}/search?q=analytical&source={source_id}",
            server.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["total_results"], 1);
}

#[tokio::test]
async fn search_rejects_unknown_source_and_bad_sort() {
    let server = spawn_server().await;

    let resp = server
        .client
        .get(format!("{}/search?q=x&source=nope", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .get(format!("{}/search?q=x&sort=upside_down", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn source_crud_roundtrip() {
    let server = spawn_server().await;

    let resp = server
        .client
        .post(format!("{}/harvest/sources", server.base))
        .json(&serde_json::json!({
            "name": "Example Repo",
            "endpoint_url": "https://repo.example.org/oai",
            "schedule": "every 6h"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "active");
    assert_eq!(created["metadata_format"], "oai_dc");

    let resp = server
        .client
        .get(format!("{}/harvest/sources", server.base))
        .send()
        .await
        .unwrap();
    let listed: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let resp = server
        .client
        .get(format!("{}/harvest/sources/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server
        .client
        .delete(format!("{}/harvest/sources/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = server
        .client
        .get(format!("{}/harvest/sources/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn create_source_validates_input() {
    let server = spawn_server().await;

    let resp = server
        .client
        .post(format!("{}/harvest/sources", server.base))
        .json(&serde_json::json!({
            "name": "  ",
            "endpoint_url": "https://repo.example.org/oai"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .post(format!("{}/harvest/sources", server.base))
        .json(&serde_json::json!({
            "name": "Example",
            "endpoint_url": "https://repo.example.org/oai",
            "schedule": "whenever"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn trigger_answers_202_then_409_while_running() {
    let provider = MockServer::start().await;
    // Slow single-page response so the run is still in flight for the
    // second trigger
    Mock::given(method("GET"))
        .and(path("/oai"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(500))
                .set_body_string(
                    r#"<OAI-PMH xmlns:dc="http://purl.org/dc/elements/1.1/"><ListRecords>
<record><header><identifier>oai:1</identifier></header>
<metadata><dc:title>One</dc:title></metadata></record>
</ListRecords></OAI-PMH>"#,
                ),
        )
        .mount(&provider)
        .await;

    let server = spawn_server().await;
    let resp = server
        .client
        .post(format!("{}/harvest/sources", server.base))
        .json(&serde_json::json!({
            "name": "example",
            "endpoint_url": format!("{}/oai", provider.uri())
        }))
        .send()
        .await
        .unwrap();
    let created: serde_json::Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let resp = server
        .client
        .post(format!("{}/harvest/sources/{id}/harvest", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let log: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(log["status"], "running");

    let resp = server
        .client
        .post(format!("{}/harvest/sources/{id}/harvest", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Unknown source id is a 404, not a 409
    let resp = server
        .client
        .post(format!(
            "{}/harvest/sources/{}/harvest",
            server.base,
            uuid::Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Wait out the run, then check logs and metrics
    for _ in 0..100 {
        let resp = server
            .client
            .get(format!("{}/harvest/logs?source_id={id}", server.base))
            .send()
            .await
            .unwrap();
        let logs: serde_json::Value = resp.json().await.unwrap();
        if logs[0]["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let resp = server
        .client
        .get(format!("{}/harvest/metrics", server.base))
        .send()
        .await
        .unwrap();
    let metrics: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(metrics["total_runs"], 1);
    assert_eq!(metrics["completed"], 1);
    assert_eq!(metrics["records_processed"], 1);
}
