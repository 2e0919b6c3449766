//! Shared helpers for devhost-api integration tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use devhost_api::{create_app, ApiConfig};
use devhost_orchestrator::test_utils::{ScriptedExecutor, TestHarness};
use tower::ServiceExt;

/// An app over a fresh harness. Keep the harness alive for the whole test:
/// it owns the build root.
pub struct TestApp {
    pub app: Router,
    pub harness: TestHarness,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_executor(ScriptedExecutor::default()).await
    }

    pub async fn with_executor(executor: ScriptedExecutor) -> Self {
        let harness = TestHarness::with_executor(executor).await;
        let app = create_app(harness.manager.clone(), &ApiConfig::default())
            .expect("Failed to create test app");
        Self { app, harness }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request")
    }

    pub async fn get(&self, uri: &str, user: Option<&str>) -> Response<Body> {
        self.send(request("GET", uri, user).body(Body::empty()).unwrap())
            .await
    }

    pub async fn delete(&self, uri: &str, user: &str) -> Response<Body> {
        self.send(request("DELETE", uri, Some(user)).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(
        &self,
        uri: &str,
        user: Option<&str>,
        body: serde_json::Value,
    ) -> Response<Body> {
        let request = request("POST", uri, user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }
}

fn request(method: &str, uri: &str, user: Option<&str>) -> axum::http::request::Builder {
    let builder = Request::builder().method(method).uri(uri);
    match user {
        Some(user) => builder.header("x-user", user),
        None => builder,
    }
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// A gzip tar holding the given files.
pub fn workspace_archive(files: &[(&str, &str)]) -> Vec<u8> {
    use flate2::{write::GzEncoder, Compression};

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .expect("Failed to append archive entry");
    }
    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .expect("Failed to finish archive")
}

/// A multipart/form-data body with one file field and some text fields.
pub fn multipart_body(
    boundary: &str,
    file_field: Option<(&str, &[u8])>,
    text_fields: &[(&str, &str)],
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in text_fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((name, bytes)) = file_field {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"workspace.tar.gz\"\r\nContent-Type: application/gzip\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
