//! Integration tests for the provider client against a mock provider API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use relay_core::provider::{ProviderClient, ProviderConfig, ProviderError, StagedFile, Throttle};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> ProviderConfig {
    ProviderConfig {
        base_url: format!("{}/v1/disk/", server.uri()),
        token: "test-token".to_string(),
        staging_dir: "/Downloads".to_string(),
        poll_interval: Duration::from_millis(10),
        operation_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
    }
}

fn client_for(server: &MockServer) -> ProviderClient {
    ProviderClient::new(config_for(server), Arc::new(Throttle::disabled()))
        .expect("client should build")
}

fn staged(name: &str) -> StagedFile {
    StagedFile {
        name: name.to_string(),
        remote_path: format!("/Downloads/{name}"),
    }
}

#[tokio::test]
async fn test_resolve_metadata_sends_token_and_parses_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/public/resources"))
        .and(query_param("public_key", "https://disk.example/d/abc"))
        .and(query_param("path", "/movie.mkv"))
        .and(header("Authorization", "OAuth test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "movie.mkv",
            "type": "file",
            "size": 12,
            "modified": "2024-01-01T00:00:00+00:00"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let meta = client_for(&server)
        .resolve_metadata("https://disk.example/d/abc", "/movie.mkv")
        .await
        .expect("metadata should resolve");

    assert_eq!(meta.name, "movie.mkv");
    assert_eq!(meta.size, Some(12));
    assert_eq!(meta.modified_time, 1_704_067_200);
    assert!(!meta.is_directory);
    assert!(meta.children.is_none());
}

#[tokio::test]
async fn test_resolve_metadata_directory_lists_children() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/public/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "season",
            "type": "dir",
            "modified": "2024-01-01T00:00:00+00:00",
            "_embedded": { "items": [
                { "name": "e01.mkv", "type": "file", "size": 5, "modified": "2024-01-02T00:00:00.5+00:00" },
                { "name": "extras", "type": "dir", "modified": "2024-01-03T00:00:00+00:00" }
            ]}
        })))
        .mount(&server)
        .await;

    let meta = client_for(&server)
        .resolve_metadata("key", "/season")
        .await
        .unwrap();

    assert!(meta.is_directory);
    let children = meta.children.unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].modified_time, 1_704_153_601);
    assert!(children[1].is_directory);
}

#[tokio::test]
async fn test_resolve_metadata_not_found_is_http_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/public/resources"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "DiskNotFoundError"})))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .resolve_metadata("key", "/missing.bin")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::HttpStatus { status: 404, .. }));
}

#[tokio::test]
async fn test_resolve_metadata_malformed_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/public/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .resolve_metadata("key", "/a")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Malformed { .. }));
}

#[tokio::test]
async fn test_rate_limited_response_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/public/resources"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .resolve_metadata("key", "/a")
        .await
        .unwrap_err();

    match err {
        ProviderError::HttpStatus {
            status,
            retry_after,
            ..
        } => {
            assert_eq!(status, 429);
            assert_eq!(retry_after.as_deref(), Some("5"));
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn test_save_synchronous_returns_staged_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/disk/public/resources/save-to-disk"))
        .and(query_param("public_key", "key"))
        .and(query_param("path", "/films/movie.mkv"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "href": "https://cloud-api.example/v1/disk/resources?path=disk%3A%2FDownloads%2Fmovie.mkv",
            "method": "GET"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let staged_file = client_for(&server)
        .save_to_recipient_storage("key", "/films/movie.mkv")
        .await
        .unwrap();

    assert_eq!(staged_file, staged("movie.mkv"));
}

#[tokio::test]
async fn test_save_asynchronous_polls_until_success() {
    let server = MockServer::start().await;
    let operation_href = format!("{}/v1/disk/operations/op-42", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/disk/public/resources/save-to-disk"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "href": operation_href,
            "method": "GET"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/operations/op-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "in-progress"})))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/operations/op-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
        .expect(1)
        .mount(&server)
        .await;

    let staged_file = client_for(&server)
        .save_to_recipient_storage("key", "/movie.mkv")
        .await
        .unwrap();

    assert_eq!(staged_file.remote_path, "/Downloads/movie.mkv");
}

#[tokio::test]
async fn test_save_asynchronous_failure_is_operation_failed() {
    let server = MockServer::start().await;
    let operation_href = format!("{}/v1/disk/operations/op-7", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/disk/public/resources/save-to-disk"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "href": operation_href })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/operations/op-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "failed"})))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .save_to_recipient_storage("key", "/movie.mkv")
        .await
        .unwrap_err();

    assert!(err.is_operation_failure());
    assert!(matches!(err, ProviderError::OperationFailed { ref operation } if operation == "op-7"));
}

#[tokio::test]
async fn test_save_asynchronous_gives_up_at_deadline() {
    let server = MockServer::start().await;
    let operation_href = format!("{}/v1/disk/operations/slow", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/disk/public/resources/save-to-disk"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "href": operation_href })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/operations/slow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "in-progress"})))
        .mount(&server)
        .await;

    let config = ProviderConfig {
        poll_interval: Duration::from_millis(20),
        operation_timeout: Duration::from_millis(100),
        ..config_for(&server)
    };
    let client = ProviderClient::new(config, Arc::new(Throttle::disabled())).unwrap();

    let started = Instant::now();
    let err = client
        .save_to_recipient_storage("key", "/movie.mkv")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::OperationTimedOut { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_download_link_and_file_content() {
    let server = MockServer::start().await;
    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let signed = format!("{}/signed/movie.mkv", server.uri());

    Mock::given(method("GET"))
        .and(path("/v1/disk/resources/download"))
        .and(query_param("path", "/Downloads/movie.mkv"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "href": signed })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/signed/movie.mkv"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let link = client.get_download_link(&staged("movie.mkv")).await.unwrap();
    assert_eq!(link, signed);

    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let destination = temp_dir.path().join("movie.mkv");
    let bytes = client
        .download_to_file(&link, &destination, 4096)
        .await
        .unwrap();

    assert_eq!(bytes, content.len() as u64);
    assert_eq!(std::fs::read(&destination).unwrap(), content);
}

#[tokio::test]
async fn test_stream_download_chunks_bounded_by_buffer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/signed/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10_000]))
        .mount(&server)
        .await;

    let mut chunks = client_for(&server)
        .stream_download(&format!("{}/signed/blob", server.uri()), 1000)
        .await
        .unwrap();

    let mut total = 0;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.unwrap();
        assert!(chunk.len() <= 1000);
        total += chunk.len();
    }
    assert_eq!(total, 10_000);
}

#[tokio::test]
async fn test_download_failure_leaves_no_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/signed/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let destination = temp_dir.path().join("gone.bin");
    let err = client_for(&server)
        .download_to_file(&format!("{}/signed/gone", server.uri()), &destination, 1024)
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::HttpStatus { status: 410, .. }));
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_delete_staged_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/disk/resources"))
        .and(query_param("path", "/Downloads/movie.mkv"))
        .and(query_param("permanently", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .delete_staged(&staged("movie.mkv"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shared_throttle_spaces_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/disk/public/resources"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "a", "type": "file", "size": 1, "modified": "2024-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let throttle = Arc::new(Throttle::per_period(20, Duration::from_secs(1)));
    let client = ProviderClient::new(config_for(&server), Arc::clone(&throttle)).unwrap();

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.resolve_metadata("key", "/a").await.unwrap().modified_time
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 1_704_067_200);
    }

    // Five calls at 50ms spacing need at least four intervals.
    assert!(started.elapsed() >= Duration::from_millis(200));
}
