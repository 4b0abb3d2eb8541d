//! Integration tests for the bot delivery client against a mock Bot API.

use std::error::Error as _;
use std::time::Duration;

use relay_core::delivery::{
    ArtifactId, Attachment, Delivery, DeliveryError, REASSEMBLY_INSTRUCTIONS, RequesterId,
    TelegramDelivery,
};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "123:SECRET-bot-token";

fn delivery_for(base_url: &str) -> TelegramDelivery {
    TelegramDelivery::new(
        base_url,
        TOKEN,
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .expect("delivery client should build")
}

fn rendered_chain(error: &DeliveryError) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

async fn mount_send_document(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendDocument")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 1, "document": { "file_id": "BQAC-sent" } }
        })))
        .mount(server)
        .await;
}

async fn mount_send_message(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 2 }
        })))
        .mount(server)
        .await;
}

async fn count_calls(server: &MockServer, bot_method: &str) -> usize {
    let suffix = format!("/{bot_method}");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path().ends_with(&suffix))
        .count()
}

/// Returns a base URL nothing listens on.
fn unreachable_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn test_network_error_does_not_contain_bot_token() {
    let delivery = delivery_for(&unreachable_base_url());

    let error = delivery
        .notify(RequesterId(7), "hello")
        .await
        .expect_err("nothing is listening");

    let chain = rendered_chain(&error);
    assert!(chain.contains("sendMessage"), "method should be named: {chain}");
    assert!(
        !chain.contains("SECRET"),
        "error chain must not contain the bot token: {chain}"
    );
    assert!(!format!("{error:?}").contains("SECRET"));
}

#[tokio::test]
async fn test_upload_network_error_does_not_contain_bot_token() {
    let temp = TempDir::new().unwrap();
    let part = temp.path().join("movie.zip");
    std::fs::write(&part, b"zip bytes").unwrap();
    let delivery = delivery_for(&unreachable_base_url());

    let error = delivery
        .deliver(RequesterId(7), &[Attachment::File(part)])
        .await
        .expect_err("nothing is listening");

    assert!(!rendered_chain(&error).contains("SECRET"));
}

#[tokio::test]
async fn test_malformed_body_error_does_not_contain_bot_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let error = delivery_for(&server.uri())
        .notify(RequesterId(7), "hello")
        .await
        .expect_err("body is not JSON");

    assert!(matches!(error, DeliveryError::Malformed { .. }));
    assert!(!rendered_chain(&error).contains("SECRET"));
}

#[tokio::test]
async fn test_multipart_upload_sends_reassembly_instructions_once() {
    let server = MockServer::start().await;
    mount_send_document(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .and(body_string_contains("Concatenate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 2 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let attachments: Vec<Attachment> = (1..=3)
        .map(|i| {
            let part = temp.path().join(format!("movie.zip.part{i:02}"));
            std::fs::write(&part, format!("part {i}")).unwrap();
            Attachment::File(part)
        })
        .collect();

    let ids = delivery_for(&server.uri())
        .deliver(RequesterId(7), &attachments)
        .await
        .expect("delivery should succeed");

    assert_eq!(ids.len(), 3);
    assert_eq!(count_calls(&server, "sendDocument").await, 3);
    assert_eq!(count_calls(&server, "sendMessage").await, 1);
}

#[tokio::test]
async fn test_cached_multipart_resend_sends_reassembly_instructions_once() {
    let server = MockServer::start().await;
    mount_send_document(&server).await;
    mount_send_message(&server).await;

    let attachments: Vec<Attachment> = ["a1", "a2", "a3"]
        .into_iter()
        .map(|id| Attachment::Artifact(ArtifactId::from(id)))
        .collect();

    delivery_for(&server.uri())
        .deliver(RequesterId(7), &attachments)
        .await
        .expect("re-send should succeed");

    assert_eq!(count_calls(&server, "sendDocument").await, 3);
    assert_eq!(count_calls(&server, "sendMessage").await, 1);

    let requests = server.received_requests().await.unwrap();
    let notice = requests
        .iter()
        .find(|r| r.url.path().ends_with("/sendMessage"))
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&notice.body).unwrap();
    assert_eq!(body["text"], REASSEMBLY_INSTRUCTIONS);
    assert_eq!(body["chat_id"], 7);
}

#[tokio::test]
async fn test_single_part_sends_no_instructions() {
    let server = MockServer::start().await;
    mount_send_document(&server).await;
    mount_send_message(&server).await;

    delivery_for(&server.uri())
        .deliver(RequesterId(7), &[Attachment::Artifact(ArtifactId::from("a1"))])
        .await
        .expect("re-send should succeed");

    assert_eq!(count_calls(&server, "sendDocument").await, 1);
    assert_eq!(count_calls(&server, "sendMessage").await, 0);
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after_from_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendDocument")))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 23",
            "parameters": { "retry_after": 23 }
        })))
        .mount(&server)
        .await;

    let error = delivery_for(&server.uri())
        .deliver(RequesterId(7), &[Attachment::Artifact(ArtifactId::from("a1"))])
        .await
        .expect_err("rate limited");

    assert!(matches!(error, DeliveryError::Api { status: 429, .. }));
    assert_eq!(error.retry_after(), Some(Duration::from_secs(23)));
}

#[tokio::test]
async fn test_rejection_without_parameters_has_no_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: chat not found"
        })))
        .mount(&server)
        .await;

    let error = delivery_for(&server.uri())
        .notify(RequesterId(7), "hello")
        .await
        .expect_err("rejected");

    assert!(error.to_string().contains("chat not found"));
    assert_eq!(error.retry_after(), None);
}
