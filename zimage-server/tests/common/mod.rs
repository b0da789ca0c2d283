#![allow(dead_code)]

use std::sync::Arc;

use axum::{body::Body, http::Request, Router};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use zimage_core::config::ConfigFile;
use zimage_core::paths::PathOverrides;
use zimage_core::testing::MockLoader;
use zimage_core::{AppPaths, Config, Device, DeviceMap, FeatureFlags, HardwareProfile, Worker};
use zimage_server::{router, AppState};

pub struct TestApp {
    pub dir: TempDir,
    pub loader: MockLoader,
    pub worker: Worker,
    pub app: Router,
}

pub async fn test_app() -> TestApp {
    test_app_with(HardwareProfile::from_parts(Device::Cpu, 32.0, None), None).await
}

pub async fn test_app_with(profile: HardwareProfile, public_url: Option<&str>) -> TestApp {
    let dir = TempDir::new().unwrap();
    let overrides = PathOverrides {
        data_dir: Some(dir.path().join("data")),
        output_dir: None,
    };
    let paths =
        AppPaths::resolve(&dir.path().join("cfg"), &overrides, &ConfigFile::default()).unwrap();
    let config = Config {
        paths,
        device_map: DeviceMap::ForceCpu,
        features: FeatureFlags::default(),
    };
    let loader = MockLoader::new();
    let worker = Worker::open(&config, profile, Arc::new(loader.clone()))
        .await
        .unwrap();
    let state = AppState::new(worker.clone()).with_public_url(public_url.map(str::to_string));
    TestApp {
        dir,
        loader,
        worker,
        app: router(state, None),
    }
}

pub struct TestResponse {
    pub status: axum::http::StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers.get(name).unwrap().to_str().unwrap()
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn get(app: &Router, uri: &str) -> TestResponse {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub async fn delete(app: &Router, uri: &str) -> TestResponse {
    send(app, Request::delete(uri).body(Body::empty()).unwrap()).await
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> TestResponse {
    send(
        app,
        Request::post(uri)
            .header("content-type", "application/json")
            .header("host", "studio.local:8000")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

/// A `multipart/form-data` body with one file part plus text parts.
pub fn multipart_body(
    boundary: &str,
    file: Option<(&str, &[u8])>,
    fields: &[(&str, &str)],
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

pub async fn post_multipart(app: &Router, uri: &str, boundary: &str, body: Vec<u8>) -> TestResponse {
    send(
        app,
        Request::post(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap(),
    )
    .await
}
