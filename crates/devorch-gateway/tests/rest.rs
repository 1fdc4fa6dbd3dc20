//! REST surface against a live gateway

mod common;

use common::Fixture;
use reqwest::StatusCode;
use serde_json::{json, Value};

#[tokio::test]
async fn e2e_health_and_status() {
    let fixture = Fixture::start().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(fixture.http("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let status: Value = client
        .get(fixture.http("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["services"], 0);
    assert_eq!(status["pending_approvals"], 0);

    fixture.stop().await;
}

#[tokio::test]
async fn e2e_blocked_command_is_forbidden() {
    let fixture = Fixture::start().await;
    let response = reqwest::Client::new()
        .post(fixture.http("/api/commands"))
        .json(&json!({ "command": "rm -rf /", "cwd": fixture.cwd() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "rejected");
    assert!(fixture.orchestrator.list_services().is_empty());

    fixture.stop().await;
}

#[tokio::test]
async fn e2e_approval_is_decided_once() {
    let fixture = Fixture::start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(fixture.http("/api/commands"))
        .json(&json!({ "command": "git reset --hard", "cwd": fixture.cwd() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    let approval = body["approval_id"].as_str().unwrap().to_string();

    let path = format!("/api/approvals/{}/reject", approval);
    let first = client.post(fixture.http(&path)).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let path = format!("/api/approvals/{}/approve", approval);
    let second = client.post(fixture.http(&path)).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let error: Value = second.json().await.unwrap();
    assert_eq!(error["error"], "approval_conflict");

    let command = body["id"].as_str().unwrap();
    let record: Value = client
        .get(fixture.http(&format!("/api/commands/{}", command)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["status"], "rejected");

    let missing = client
        .get(fixture.http("/api/commands/cmd_missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    fixture.stop().await;
}

#[tokio::test]
async fn e2e_service_lifecycle_and_port_conflict() {
    let fixture = Fixture::start().await;
    let client = reqwest::Client::new();
    let start = |name: &str| {
        client
            .post(fixture.http("/api/services"))
            .json(&json!({
                "name": name,
                "command": "sleep 30",
                "cwd": fixture.cwd(),
                "port": 3100,
            }))
            .send()
    };

    let first = start("api").await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let service: Value = first.json().await.unwrap();
    assert_eq!(service["status"], "running");

    let second = start("api-2").await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let error: Value = second.json().await.unwrap();
    assert_eq!(error["error"], "port_conflict");

    let listed: Vec<Value> = client
        .get(fixture.http("/api/services"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let path = format!("/api/services/{}", service["id"].as_str().unwrap());
    let stopped = client.delete(fixture.http(&path)).send().await.unwrap();
    assert_eq!(stopped.status(), StatusCode::OK);
    let again = client.delete(fixture.http(&path)).send().await.unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    fixture.stop().await;
}

#[tokio::test]
async fn e2e_guarded_service_is_refused() {
    let fixture = Fixture::start().await;
    let response = reqwest::Client::new()
        .post(fixture.http("/api/services"))
        .json(&json!({ "name": "pusher", "command": "git push --force", "cwd": fixture.cwd() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["error"], "approval_required");
    assert!(fixture.orchestrator.list_services().is_empty());

    fixture.stop().await;
}

#[tokio::test]
async fn e2e_saved_commands() {
    let fixture = Fixture::start().await;
    let client = reqwest::Client::new();

    let created = client
        .post(fixture.http("/api/saved"))
        .json(&json!({
            "name": "greet",
            "command": "echo saved",
            "working_directory": fixture.cwd(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let saved: Value = created.json().await.unwrap();
    let id = saved["id"].as_str().unwrap().to_string();

    let listed: Vec<Value> = client
        .get(fixture.http("/api/saved"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let ran = client
        .post(fixture.http(&format!("/api/saved/{}/run", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(ran.status(), StatusCode::OK);
    let submission: Value = ran.json().await.unwrap();
    assert_eq!(submission["status"], "executed");

    let path = format!("/api/saved/{}", id);
    let deleted = client.delete(fixture.http(&path)).send().await.unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    let again = client.delete(fixture.http(&path)).send().await.unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    fixture.stop().await;
}
