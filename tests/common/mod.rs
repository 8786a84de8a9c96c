//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which lays out scratch and artifact directories in
//! a temp dir and builds a full [`AppContext`] around them, plus helpers to
//! build multipart chunk requests and read response bodies.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use reelforge::config::Config;
use reelforge::finalize::Finalizer;
use reelforge::server::{create_router, AppContext};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "reelforge-test-boundary";

/// Test harness wrapping a fully-constructed [`AppContext`] backed by a
/// temporary directory.
pub struct TestHarness {
    pub ctx: AppContext,
    pub dir: TempDir,
}

impl TestHarness {
    /// Harness with conversion and publishing switched off.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness whose config is adjusted by `tweak` before wiring.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.storage.chunk_dir = dir.path().join("chunks");
        config.storage.artifact_dir = dir.path().join("uploads");
        config.storage.fsync = false;
        config.conversion.enabled = false;
        config.conversion.output_dir = dir.path().join("converted");
        tweak(&mut config);

        Self {
            ctx: AppContext::new(config),
            dir,
        }
    }

    /// Replace the finalizer (for injecting fake collaborators).
    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.ctx = self.ctx.with_finalizer(finalizer);
        self
    }

    pub fn router(&self) -> Router {
        create_router(self.ctx.clone())
    }

    pub fn chunk_dir(&self) -> PathBuf {
        self.ctx.config.storage.chunk_dir.clone()
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.ctx.config.storage.artifact_dir.join(name)
    }

    /// Send one request through a fresh router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }

    /// Upload every chunk of `data` in order and return the last response.
    pub async fn upload_all(&self, name: &str, data: &[u8], chunk_size: usize) -> Response<Body> {
        let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
        let total = chunks.len() as u64;
        let mut last = None;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let response = self
                .send(chunk_request(name, index as u64, total, chunk))
                .await;
            assert_eq!(response.status(), StatusCode::OK, "chunk {index} rejected");
            last = Some(response);
        }
        last.expect("no chunks uploaded")
    }
}

/// Files left under `dir`, recursively.
pub fn file_count(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                file_count(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Build a multipart body from text fields plus an optional `chunk` part.
pub fn multipart_body(fields: &[(&str, String)], chunk: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(chunk) = chunk {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(chunk);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/upload/chunk")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

/// A well-formed chunk delivery.
pub fn chunk_request(name: &str, index: u64, total: u64, data: &[u8]) -> Request<Body> {
    multipart_request(multipart_body(
        &[
            ("fileName", name.to_string()),
            ("chunkNumber", index.to_string()),
            ("totalChunks", total.to_string()),
        ],
        Some(data),
    ))
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_range(uri: &str, range: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::RANGE, range)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Deterministic non-repeating-looking payload.
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
