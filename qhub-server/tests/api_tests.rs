//! Integration tests for the qhub HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use pretty_assertions::assert_eq;
use qhub::testing::fixtures;
use qhub_server::{create_router, AppState};
use serde_json::{json, Value};

// ============================================================================
// Test helpers
// ============================================================================

struct Harness {
    _dir: tempfile::TempDir,
    server: TestServer,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let hub = fixtures::scripted_hub(dir.path()).await.unwrap();
    let router = create_router(Arc::new(AppState::new(Arc::new(hub))));
    let server = TestServer::new(router).expect("test server");
    Harness { _dir: dir, server }
}

fn bearer() -> String {
    format!("Bearer {}", fixtures::TEST_TOKEN)
}

async fn create_project(server: &TestServer, id: &str) {
    server
        .post("/projects")
        .authorization(bearer())
        .json(&json!({ "id": id, "name": "Bell", "template": "circuit" }))
        .await
        .assert_status(StatusCode::CREATED);
}

async fn wait_for_terminal(server: &TestServer, project: &str, run_id: &str) -> Value {
    for _ in 0..200 {
        let body: Value = server
            .get(&format!("/projects/{project}/pipeline/runs/{run_id}"))
            .authorization(bearer())
            .await
            .json();
        if matches!(body["status"].as_str(), Some("succeeded" | "failed" | "cancelled")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finish");
}

// ============================================================================
// Health and auth
// ============================================================================

#[tokio::test]
async fn test_health_needs_no_token() {
    let h = harness().await;
    let response = h.server.get("/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["open_sessions"], 0);
}

#[tokio::test]
async fn test_missing_token_is_401() {
    let h = harness().await;
    let response = h
        .server
        .post("/projects")
        .json(&json!({ "id": "p1", "name": "Bell", "template": "circuit" }))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let body: Value = response.json();
    assert_eq!(body["error"], "AUTH-UNAUTHORIZED");
    assert!(body["message"].as_str().is_some());
}

#[tokio::test]
async fn test_wrong_token_is_401() {
    let h = harness().await;
    h.server
        .get("/projects")
        .authorization("Bearer nope")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Projects
// ============================================================================

#[tokio::test]
async fn test_create_and_get_project() {
    let h = harness().await;
    let response = h
        .server
        .post("/projects")
        .authorization(bearer())
        .json(&json!({ "id": "p1", "name": "Bell", "sdk": "qiskit", "template": "circuit" }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["id"], "p1");
    assert_eq!(body["sdk"], "qiskit");
    assert_eq!(body["owner"], "tester");

    let fetched: Value = h.server.get("/projects/p1").authorization(bearer()).await.json();
    assert_eq!(fetched["template"], "circuit");

    let listed: Value = h.server.get("/projects").authorization(bearer()).await.json();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_scaffold_twice_is_409() {
    let h = harness().await;
    create_project(&h.server, "p1").await;
    let response = h
        .server
        .post("/projects")
        .authorization(bearer())
        .json(&json!({ "id": "p1", "name": "Again", "template": "algorithm" }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"], "SCAFFOLD-EXISTS");
}

#[tokio::test]
async fn test_unknown_template_is_400() {
    let h = harness().await;
    let response = h
        .server
        .post("/projects")
        .authorization(bearer())
        .json(&json!({ "id": "p1", "name": "Bell", "template": "spreadsheet" }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "SCAFFOLD-UNKNOWN-TEMPLATE");
}

#[tokio::test]
async fn test_unknown_project_is_404() {
    let h = harness().await;
    h.server
        .get("/projects/ghost")
        .authorization(bearer())
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// ============================================================================
// Pipeline runs
// ============================================================================

#[tokio::test]
async fn test_run_to_completion() {
    let h = harness().await;
    create_project(&h.server, "p1").await;

    let response = h
        .server
        .post("/projects/p1/pipeline/runs")
        .authorization(bearer())
        .json(&json!({ "stages": ["generate", "optimize"] }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let run: Value = response.json();
    let run_id = run["id"].as_str().unwrap().to_string();
    assert_eq!(run["stage_order"], json!(["generate", "optimize"]));

    let finished = wait_for_terminal(&h.server, "p1", &run_id).await;
    assert_eq!(finished["status"], "succeeded");

    let artifacts: Value = h
        .server
        .get("/projects/p1/artifacts")
        .authorization(bearer())
        .await
        .json();
    let artifacts = artifacts.as_array().unwrap();
    assert_eq!(artifacts.len(), 2);
    assert!(artifacts.iter().all(|a| a["run_id"] == run_id.as_str()));

    let filtered: Value = h
        .server
        .get("/projects/p1/artifacts")
        .add_query_param("category", "ir/optimized")
        .authorization(bearer())
        .await
        .json();
    assert_eq!(filtered.as_array().unwrap().len(), 1);
    assert_eq!(filtered[0]["version"], 1);

    let runs: Value = h
        .server
        .get("/projects/p1/pipeline/runs")
        .authorization(bearer())
        .await
        .json();
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_without_body_runs_everything() {
    let h = harness().await;
    create_project(&h.server, "p1").await;

    let run: Value = h
        .server
        .post("/projects/p1/pipeline/runs")
        .authorization(bearer())
        .await
        .json();
    assert_eq!(run["stage_order"].as_array().unwrap().len(), 7);
    let finished = wait_for_terminal(&h.server, "p1", run["id"].as_str().unwrap()).await;
    assert_eq!(finished["status"], "succeeded");
}

#[tokio::test]
async fn test_cancel_finished_run_is_noop() {
    let h = harness().await;
    create_project(&h.server, "p1").await;
    let run: Value = h
        .server
        .post("/projects/p1/pipeline/runs")
        .authorization(bearer())
        .json(&json!({ "stages": ["generate"] }))
        .await
        .json();
    let run_id = run["id"].as_str().unwrap().to_string();
    wait_for_terminal(&h.server, "p1", &run_id).await;

    let response = h
        .server
        .post(&format!("/projects/p1/pipeline/runs/{run_id}/cancel"))
        .authorization(bearer())
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "succeeded");
}

#[tokio::test]
async fn test_unknown_run_is_404() {
    let h = harness().await;
    create_project(&h.server, "p1").await;
    h.server
        .get("/projects/p1/pipeline/runs/run-missing")
        .authorization(bearer())
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bad_category_is_400() {
    let h = harness().await;
    create_project(&h.server, "p1").await;
    h.server
        .get("/projects/p1/artifacts")
        .add_query_param("category", "IR//base")
        .authorization(bearer())
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_session_lifecycle() {
    let h = harness().await;
    create_project(&h.server, "p1").await;

    let first: Value = h
        .server
        .post("/projects/p1/sessions")
        .authorization(bearer())
        .await
        .json();
    assert_eq!(first["status"], "ready");
    let session_id = first["id"].as_str().unwrap().to_string();
    assert!(first["endpoint"].as_str().unwrap().contains(&session_id));

    let again: Value = h
        .server
        .post("/projects/p1/sessions")
        .authorization(bearer())
        .await
        .json();
    assert_eq!(again["id"], session_id.as_str());

    let health: Value = h.server.get("/health").await.json();
    assert_eq!(health["open_sessions"], 1);

    let fetched: Value = h
        .server
        .get(&format!("/projects/p1/sessions/{session_id}"))
        .authorization(bearer())
        .await
        .json();
    assert_eq!(fetched["status"], "ready");

    let closed: Value = h
        .server
        .delete(&format!("/projects/p1/sessions/{session_id}"))
        .authorization(bearer())
        .await
        .json();
    assert_eq!(closed["status"], "closed");

    h.server
        .delete(&format!("/projects/p1/sessions/{session_id}"))
        .authorization(bearer())
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_session_for_unknown_project_is_404() {
    let h = harness().await;
    h.server
        .post("/projects/ghost/sessions")
        .authorization(bearer())
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
