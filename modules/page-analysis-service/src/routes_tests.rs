//! HTTP-level tests: the real router on an ephemeral port, a canned analyzer
//! and an in-memory database.

use crate::analyzer::{AnalysisRequest, Analyzer, AnalyzerError};
use crate::config::Config;
use crate::db::Db;
use crate::registry::SessionRegistry;
use crate::routes::{self, AppState};
use crate::runner::AnalysisTaskRunner;
use async_trait::async_trait;
use page_analysis_types::*;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Answers every page with a fixed element list, every scenario request
/// with a single scenario and every script request with a fenced stub
struct CannedAnalyzer;

#[async_trait]
impl Analyzer for CannedAnalyzer {
    async fn invoke(&self, request: AnalysisRequest<'_>) -> Result<String, AnalyzerError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let body = match request.kind {
            JobKind::PageAnalysis => json!({
                "title": format!("Page {}", request.index + 1),
                "description": "rendered",
                "elements": [{"id": "e1", "name": "Search", "element_type": "input",
                              "description": "search box", "confidence_score": 0.9}]
            }),
            JobKind::TestScenarios => json!({
                "suggested_test_scenarios": [
                    {"scenario_id": "TC001", "scenario_name": "Search works", "priority": "high"}
                ]
            }),
            JobKind::ScriptGeneration => {
                return Ok(format!(
                    "```{}\n# {} scenario(s)\n```",
                    request.item.name,
                    request.context.test_scenarios.len()
                ));
            }
        };
        Ok(body.to_string())
    }
}

struct TestServer {
    base: String,
    registry: Arc<SessionRegistry>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let config = Config {
            stream_poll: Duration::from_millis(20),
            stream_grace: Duration::from_millis(5),
            max_upload_bytes: 1024,
            ..Config::default()
        };
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let registry = SessionRegistry::new();
        let runner = Arc::new(AnalysisTaskRunner::new(
            registry.clone(),
            Arc::new(CannedAnalyzer),
            db.clone(),
            config.session_timeout,
        ));
        let state = Arc::new(AppState {
            registry: registry.clone(),
            runner,
            db,
            config,
            start_time: Instant::now(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, routes::router(state)).await.unwrap();
        });

        TestServer {
            base: format!("http://{}", addr),
            registry,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn upload(&self, files: Vec<(&str, &str, Vec<u8>)>) -> (StatusCode, Value) {
        let mut form = Form::new().text("page_name", "Search").text("page_url", "https://example.com");
        for (name, mime, bytes) in files {
            let part = Part::bytes(bytes).file_name(name.to_string()).mime_str(mime).unwrap();
            form = form.part("files", part);
        }
        let resp = self
            .client
            .post(self.url("/api/v1/web/page-analysis/upload-and-analyze"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn wait_for_terminal(&self, session_id: &str) -> Value {
        let path = format!("/api/v1/web/sessions/{}/status", session_id);
        for _ in 0..200 {
            let (_, body) = self.get_json(&path).await;
            let status = body["data"]["status"].as_str().unwrap_or_default().to_string();
            if status == "completed" || status == "failed" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never finished", session_id);
    }
}

/// Values of one SSE field, in order
fn sse_field<'a>(text: &'a str, name: &str) -> Vec<&'a str> {
    text.lines()
        .filter_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
        .map(|value| value.trim())
        .collect()
}

fn png() -> Vec<u8> {
    vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3]
}

#[tokio::test]
async fn health_reports_active_sessions() {
    let server = TestServer::start().await;
    let (status, body) = server.get_json("/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["active_sessions"], 0);
}

#[tokio::test]
async fn upload_streams_session_to_completion() {
    let server = TestServer::start().await;
    let (status, body) = server
        .upload(vec![("home.png", "image/png", png()), ("cart.png", "image/png", png())])
        .await;
    assert_eq!(status, StatusCode::OK);
    let data = &body["data"];
    assert_eq!(data["kind"], "page_analysis");
    assert_eq!(data["items"], json!(["home.png", "cart.png"]));
    let stream_path = data["stream_endpoint"].as_str().unwrap().to_string();

    let resp = server.client.get(server.url(&stream_path)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["cache-control"], "no-cache");
    assert_eq!(resp.headers()["x-accel-buffering"], "no");
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    // The body ends once the close frame is sent
    let text = resp.text().await.unwrap();
    let events: Vec<&str> = sse_field(&text, "event")
        .into_iter()
        .filter(|e| *e != "ping")
        .collect();
    assert_eq!(events.first(), Some(&"session"));
    assert_eq!(&events[events.len() - 2..], &["final_result", "close"]);
    assert_eq!(sse_field(&text, "id").first(), Some(&"0"));
    assert!(text.contains("\"region\":\"analysis\""));

    let session_id = data["session_id"].as_str().unwrap();
    let status = server.wait_for_terminal(session_id).await;
    assert_eq!(status["data"]["status"], "completed");
    assert_eq!(status["data"]["processed_items"], 2);
    assert_eq!(status["data"]["progress"], 100);
}

#[tokio::test]
async fn non_image_upload_is_rejected_without_session() {
    let server = TestServer::start().await;
    let (status, body) = server
        .upload(vec![("notes.txt", "text/plain", b"hello".to_vec())])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("notes.txt"));
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn oversized_and_missing_uploads_are_rejected() {
    let server = TestServer::start().await;
    let (status, _) = server
        .upload(vec![("big.png", "image/png", vec![0u8; 2048])])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server.upload(vec![]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "At least one image file is required");
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn unknown_sessions_are_not_found() {
    let server = TestServer::start().await;
    let (status, body) = server.get_json("/api/v1/web/sessions/nope/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let resp = server
        .client
        .get(server.url("/api/v1/web/sessions/nope/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server
        .client
        .delete(server.url("/api/v1/web/sessions/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_is_stable_and_delete_removes_session() {
    let server = TestServer::start().await;
    let (_, body) = server.upload(vec![("home.png", "image/png", png())]).await;
    let session_id = body["data"]["session_id"].as_str().unwrap().to_string();
    server.wait_for_terminal(&session_id).await;

    let path = format!("/api/v1/web/sessions/{}/status", session_id);
    let (_, first) = server.get_json(&path).await;
    let (_, second) = server.get_json(&path).await;
    assert_eq!(first, second);
    assert_eq!(first["data"]["context"]["page_name"], "Search");

    let (_, listed) = server.get_json("/api/v1/web/sessions").await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/web/sessions/{}", session_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, _) = server.get_json(&path).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn analyze_text_requires_description() {
    let server = TestServer::start().await;
    let url = server.url("/api/v1/web/test-case-creation/analyze-text");

    let resp = server
        .client
        .post(&url)
        .json(&json!({"test_description": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .client
        .post(&url)
        .json(&json!({"test_description": "search returns results", "generate_formats": "yaml,playwright"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["kind"], "test_scenarios");

    let session_id = body["data"]["session_id"].as_str().unwrap();
    let status = server.wait_for_terminal(session_id).await;
    assert_eq!(status["data"]["status"], "completed");
    assert_eq!(
        status["data"]["context"]["generate_formats"],
        json!(["yaml", "playwright"])
    );
}

#[tokio::test]
async fn analyze_image_accepts_optional_screenshot() {
    let server = TestServer::start().await;
    let url = server.url("/api/v1/web/test-case-creation/analyze-image");

    let form = Form::new().text("test_description", "login form validation");
    let resp = server.client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let part = Part::bytes(png()).file_name("login.png").mime_str("image/png").unwrap();
    let form = Form::new()
        .text("test_description", "login form validation")
        .part("file", part);
    let resp = server.client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["items"], json!(["login.png"]));

    let form = Form::new().text("additional_context", "no description");
    let resp = server.client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn persisted_pages_can_be_listed_read_and_deleted() {
    let server = TestServer::start().await;
    let (_, body) = server.upload(vec![("home.png", "image/png", png())]).await;
    let session_id = body["data"]["session_id"].as_str().unwrap().to_string();
    server.wait_for_terminal(&session_id).await;

    let (status, list) = server.get_json("/api/v1/web/pages?page=1&page_size=10&search=sea").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["data"]["total"], 1);
    let page_id = list["data"]["pages"][0]["id"].as_i64().unwrap();

    let (status, detail) = server.get_json(&format!("/api/v1/web/pages/{}", page_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["data"]["elements"][0]["element_name"], "Search");

    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/web/pages/{}", page_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, _) = server.get_json(&format!("/api/v1/web/pages/{}", page_id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn knowledge_base_queries_stored_pages() {
    let server = TestServer::start().await;
    let (_, body) = server.upload(vec![("home.png", "image/png", png())]).await;
    let session_id = body["data"]["session_id"].as_str().unwrap().to_string();
    server.wait_for_terminal(&session_id).await;

    let (status, summary) = server.get_json("/api/v1/web/knowledge-base/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["data"]["total_pages"], 1);
    assert_eq!(summary["data"]["total_elements"], 1);
    assert_eq!(summary["data"]["element_types"][0]["element_type"], "input");

    let (status, found) = server
        .get_json("/api/v1/web/knowledge-base/ui-elements/inp?limit=5")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["data"]["total"], 1);
    assert_eq!(found["data"]["elements"][0]["element_name"], "Search");

    let url = server.url("/api/v1/web/knowledge-base/search-by-keywords");
    let resp = server
        .client
        .post(&url)
        .json(&json!({"keywords": ["  ", "search"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let results: Value = resp.json().await.unwrap();
    assert_eq!(results["data"]["total"], 1);
    assert_eq!(results["data"]["keywords"], json!(["search"]));
    let page_id = results["data"]["results"][0]["id"].as_i64().unwrap();

    let resp = server
        .client
        .post(&url)
        .json(&json!({"keywords": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let (status, elements) = server
        .get_json(&format!("/api/v1/web/pages/{}/elements", page_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(elements["data"]["total"], 1);

    let (status, _) = server
        .get_json(&format!("/api/v1/web/pages/{}/elements", page_id + 1000))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn scripts_are_generated_from_a_scenario_session() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .post(server.url("/api/v1/web/test-case-creation/analyze-text"))
        .json(&json!({"test_description": "search returns results"}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let scenario_session = body["data"]["session_id"].as_str().unwrap().to_string();
    server.wait_for_terminal(&scenario_session).await;

    let url = server.url("/api/v1/web/test-case-creation/generate-scripts");
    let resp = server
        .client
        .post(&url)
        .json(&json!({"session_id": scenario_session}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["kind"], "script_generation");
    assert_eq!(body["data"]["items"], json!(["yaml", "playwright"]));

    let script_session = body["data"]["session_id"].as_str().unwrap();
    let status = server.wait_for_terminal(script_session).await;
    assert_eq!(status["data"]["status"], "completed");
    assert_eq!(status["data"]["processed_items"], 2);
    assert_eq!(
        status["data"]["context"]["test_scenarios"][0]["scenario_name"],
        "Search works"
    );
}

#[tokio::test]
async fn generate_scripts_validates_input() {
    let server = TestServer::start().await;
    let url = server.url("/api/v1/web/test-case-creation/generate-scripts");

    let cases = [
        (json!({}), StatusCode::BAD_REQUEST),
        (json!({"session_id": "missing"}), StatusCode::NOT_FOUND),
        (
            json!({"test_scenarios": [{"scenario_name": "a"}], "generate_formats": ["cypress"]}),
            StatusCode::BAD_REQUEST,
        ),
    ];
    for (request, expected) in cases {
        let resp = server.client.post(&url).json(&request).send().await.unwrap();
        assert_eq!(resp.status(), expected, "request {}", request);
    }

    let resp = server
        .client
        .post(&url)
        .json(&json!({"test_scenarios": [{"scenario_name": "a"}], "generate_formats": ["YAML"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["items"], json!(["yaml"]));
}
