//! Publishing integration tests against a mock upload endpoint.

mod common;

use axum::http::StatusCode;
use common::*;
use reelforge::publish::{HttpPublisher, Publisher};
use reelforge_common::Error;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn publisher_for(server: &MockServer, api_key: Option<&str>) -> HttpPublisher {
    HttpPublisher::new(
        format!("{}/upload", server.uri()),
        api_key.map(str::to_string),
        "video",
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn publish_returns_secure_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(header("authorization", "Bearer s3cret"))
        .and(body_string_contains("name=\"resource_type\""))
        .and(body_string_contains("filename=\"clip.mp4\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "secure_url": "https://cdn.example.com/v1/clip.mp4",
            "url": "http://cdn.example.com/v1/clip.mp4"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("clip.mp4");
    // Text payload: the body matchers only look at UTF-8 bodies.
    std::fs::write(&file, "fake mp4 payload ".repeat(128)).unwrap();

    let url = publisher_for(&server, Some("s3cret"))
        .publish(&file)
        .await
        .unwrap();
    assert_eq!(url, "https://cdn.example.com/v1/clip.mp4");
}

#[tokio::test]
async fn publish_falls_back_to_plain_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"url": "http://cdn.example.com/a.mp4"})),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.mp4");
    std::fs::write(&file, b"abc").unwrap();

    let url = publisher_for(&server, None).publish(&file).await.unwrap();
    assert_eq!(url, "http://cdn.example.com/a.mp4");
}

#[tokio::test]
async fn rejected_publish_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.mp4");
    std::fs::write(&file, b"abc").unwrap();

    let err = publisher_for(&server, None).publish(&file).await.unwrap_err();
    assert!(matches!(err, Error::Publish(ref msg) if msg.contains("bad credentials")));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn reply_without_url_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 7})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.mp4");
    std::fs::write(&file, b"abc").unwrap();

    let err = publisher_for(&server, None).publish(&file).await.unwrap_err();
    assert!(matches!(err, Error::Publish(_)));
}

#[tokio::test]
async fn completed_upload_is_published() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "secure_url": "https://cdn.example.com/clip.mp4"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = format!("{}/upload", server.uri());
    let harness = TestHarness::with_config(|config| {
        config.publish.enabled = true;
        config.publish.endpoint = Some(endpoint);
    });

    let data = sample_bytes(5000);
    let response = harness.upload_all("clip.mp4", &data, 1000).await;
    let json = body_json(response).await;

    assert_eq!(json["published_url"], "https://cdn.example.com/clip.mp4");
    assert!(json["publish_error"].is_null());
    // The local copy stays playable after publishing.
    assert_eq!(std::fs::read(harness.artifact_path("clip.mp4")).unwrap(), data);
}

#[tokio::test]
async fn failed_publish_keeps_local_playback_and_can_be_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "secure_url": "https://cdn.example.com/clip.mp4"
        })))
        .mount(&server)
        .await;

    let endpoint = format!("{}/upload", server.uri());
    let harness = TestHarness::with_config(|config| {
        config.publish.enabled = true;
        config.publish.endpoint = Some(endpoint);
    });

    let response = harness.upload_all("clip.mp4", &sample_bytes(400), 100).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["published_url"].is_null());
    assert!(json["publish_error"].as_str().unwrap().contains("503"));
    assert_eq!(json["playback_url"], "/api/play/clip.mp4");

    let response = harness.send(get("/api/play/clip.mp4")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let retry = axum::http::Request::builder()
        .method("POST")
        .uri("/api/upload/complete")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"fileName":"clip.mp4"}"#))
        .unwrap();
    let json = body_json(harness.send(retry).await).await;
    assert_eq!(json["published_url"], "https://cdn.example.com/clip.mp4");
}
