//! Integration tests for the REST endpoints

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{json_body, multipart_body, workspace_archive, TestApp};
use devhost_orchestrator::test_utils::{wait_for_removal, wait_for_state};
use devhost_orchestrator::InstanceState;
use serde_json::json;

async fn create_simple(app: &TestApp, user: &str) -> String {
    let response = app
        .post_json(
            "/api/v1/instances",
            Some(user),
            json!({"mode": "simple", "base_image": "ubuntu:22.04"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    body["instance_id"]
        .as_str()
        .expect("instance_id in response")
        .to_string()
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let app = TestApp::new().await;

    let response = app.get("/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "devhost-api");

    let response = app.get("/health/ready", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_instance_routes_require_identity() {
    let app = TestApp::new().await;

    let response = app
        .post_json("/api/v1/instances", None, json!({"mode": "simple"}))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.get("/api/v1/instances", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_proxy_header_takes_precedence() {
    let app = TestApp::new().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/instances")
        .header("content-type", "application/json")
        .header("x-devhost-user", "alice")
        .header("x-user", "mallory")
        .body(Body::from(json!({"mode": "simple"}).to_string()))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["user_id"], "alice");
}

#[tokio::test]
async fn test_simple_instance_reaches_running() {
    let app = TestApp::new().await;
    let id = create_simple(&app, "alice").await;
    assert!(id.starts_with("alice-"));

    wait_for_state(&app.harness.manager, &id, InstanceState::Running).await;

    let response = app.get(&format!("/api/v1/instances/{id}"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    assert_eq!(body["state"], "running");
    assert_eq!(body["creation_mode"], "simple");
    let token = body["access_token"].as_str().expect("token while running");
    let url = body["url"].as_str().expect("url while running");
    let domain = &app.harness.manager.config().base_domain;
    assert_eq!(url, format!("https://{domain}/instances/{id}?tkn={token}"));
    assert!(body["build_logs_url"].is_null());
    assert!(body["built_image_reference"].is_null());
    assert_eq!(body["resource_refs"].as_array().map(Vec::len), Some(4));
}

#[tokio::test]
async fn test_invalid_image_is_bad_request() {
    let app = TestApp::new().await;

    let response = app
        .post_json(
            "/api/v1/instances",
            Some("alice"),
            json!({"mode": "simple", "base_image": "-not an image"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"]
        .as_str()
        .is_some_and(|e| e.contains("invalid base image")));

    let response = app
        .post_json(
            "/api/v1/instances",
            Some("alice"),
            json!({"mode": "devcontainer"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_devcontainer_build_logs() {
    let app = TestApp::new().await;

    let response = app
        .post_json(
            "/api/v1/instances",
            Some("bob"),
            json!({
                "mode": "devcontainer",
                "devcontainer": {"image": "mcr.microsoft.com/devcontainers/rust:1"},
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let id = json_body(response).await["instance_id"]
        .as_str()
        .unwrap()
        .to_string();

    let record = wait_for_state(&app.harness.manager, &id, InstanceState::Running).await;
    assert!(record.built_image_reference.is_some());

    let response = app
        .get(&format!("/api/v1/instances/{id}/build-logs"), Some("bob"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let lines = body["lines"].as_array().expect("lines array");
    assert!(lines
        .iter()
        .any(|l| l.as_str().is_some_and(|l| l.starts_with("Step 1/2"))));
    let next = body["next_offset"].as_i64().unwrap();
    assert_eq!(next, lines.len() as i64);

    let response = app
        .get(
            &format!("/api/v1/instances/{id}/build-logs?offset={next}"),
            Some("bob"),
        )
        .await;
    let body = json_body(response).await;
    assert_eq!(body["lines"].as_array().map(Vec::len), Some(0));

    let response = app
        .get(
            &format!("/api/v1/instances/{id}/build-logs?offset={}", u64::MAX),
            Some("bob"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.get(&format!("/api/v1/instances/{id}"), Some("bob")).await;
    let body = json_body(response).await;
    assert_eq!(body["creation_mode"], "dev_container_spec");
    assert!(body["build_logs_url"]
        .as_str()
        .is_some_and(|u| u.ends_with(&format!("/api/v1/instances/{id}/build-logs"))));
}

#[tokio::test]
async fn test_simple_instance_has_no_build_log() {
    let app = TestApp::new().await;
    let id = create_simple(&app, "alice").await;

    let response = app
        .get(&format!("/api/v1/instances/{id}/build-logs"), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_other_users_instances_are_forbidden() {
    let app = TestApp::new().await;
    let id = create_simple(&app, "alice").await;

    let response = app.get(&format!("/api/v1/instances/{id}"), Some("bob")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.delete(&format!("/api/v1/instances/{id}"), "bob").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .get("/api/v1/instances/alice-ffffffff", Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_shows_only_callers_instances() {
    let app = TestApp::new().await;
    let first = create_simple(&app, "alice").await;
    let second = create_simple(&app, "alice").await;
    create_simple(&app, "bob").await;

    for id in [&first, &second] {
        wait_for_state(&app.harness.manager, id, InstanceState::Running).await;
    }

    let response = app.get("/api/v1/instances", Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let instances = body["instances"].as_array().expect("instances array");
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i["user_id"] == "alice"));

    let response = app
        .get("/api/v1/instances?state=failed", Some("alice"))
        .await;
    let body = json_body(response).await;
    assert_eq!(body["instances"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let app = TestApp::new().await;
    let id = create_simple(&app, "alice").await;
    wait_for_state(&app.harness.manager, &id, InstanceState::Running).await;

    let response = app.delete(&format!("/api/v1/instances/{id}"), "alice").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["instance_id"], id.as_str());
    assert_eq!(body["status"], "terminating");

    wait_for_removal(&app.harness.manager, &id).await;
    assert!(app.harness.cluster.objects_for_instance(&id).is_empty());

    let response = app.delete(&format!("/api/v1/instances/{id}"), "alice").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "already_deleted");

    let response = app.get(&format!("/api/v1/instances/{id}"), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_idempotency_key_reuse() {
    let app = TestApp::new().await;

    let body = json!({"mode": "simple", "idempotency_key": "create-42"});
    let first = json_body(app.post_json("/api/v1/instances", Some("alice"), body.clone()).await).await;
    let again = app.post_json("/api/v1/instances", Some("alice"), body).await;
    assert_eq!(again.status(), StatusCode::CREATED);
    assert_eq!(json_body(again).await["instance_id"], first["instance_id"]);

    let conflicting = app
        .post_json(
            "/api/v1/instances",
            Some("alice"),
            json!({
                "mode": "devcontainer",
                "devcontainer": {"image": "ubuntu:22.04"},
                "idempotency_key": "create-42",
            }),
        )
        .await;
    assert_eq!(conflicting.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_workspace_upload_creates_instance() {
    let app = TestApp::new().await;
    let archive = workspace_archive(&[
        (
            ".devcontainer/devcontainer.json",
            r#"{"image": "mcr.microsoft.com/devcontainers/python:3"}"#,
        ),
        ("src/main.py", "print('hello')\n"),
    ]);
    let boundary = "devhost-test-boundary";
    let body = multipart_body(
        boundary,
        Some(("workspace", archive.as_slice())),
        &[("memory_limit", "4Gi"), ("vscode_version", "1.97.2")],
    );

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/instances/workspace")
        .header("x-user", "carol")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["creation_mode"], "workspace");
    assert_eq!(body["base_image"], "mcr.microsoft.com/devcontainers/python:3");
    assert_eq!(body["resources"]["memory_limit"], "4Gi");

    let id = body["instance_id"].as_str().unwrap();
    wait_for_state(&app.harness.manager, id, InstanceState::Running).await;
}

#[tokio::test]
async fn test_workspace_upload_requires_file() {
    let app = TestApp::new().await;
    let boundary = "devhost-test-boundary";

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/instances/workspace")
        .header("x-user", "carol")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(multipart_body(
            boundary,
            None,
            &[("memory_limit", "4Gi")],
        )))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"]
        .as_str()
        .is_some_and(|e| e.contains("workspace")));
}

#[tokio::test]
async fn test_workspace_upload_rejects_archive_without_config() {
    let app = TestApp::new().await;
    let archive = workspace_archive(&[("README.md", "no config here\n")]);
    let boundary = "devhost-test-boundary";

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/instances/workspace")
        .header("x-user", "carol")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(multipart_body(
            boundary,
            Some(("workspace", archive.as_slice())),
            &[],
        )))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
