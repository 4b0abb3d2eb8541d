//! Chat bot delivery through the Telegram Bot API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{ArtifactId, Attachment, Delivery, DeliveryError, RequesterId};
use crate::user_agent;

/// Default Bot API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Message sent after a multi-part delivery.
pub const REASSEMBLY_INSTRUCTIONS: &str = "The file was too large to send in one piece. \
    Concatenate the .partNN files in order (e.g. `cat file.zip.part* > file.zip` or \
    `copy /b file.zip.part01+file.zip.part02 file.zip`), then unzip the result.";

/// Uploads documents to chat users through a bot account.
#[derive(Debug, Clone)]
pub struct TelegramDelivery {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    #[serde(default)]
    document: Option<SentDocument>,
}

#[derive(Debug, Deserialize)]
struct SentDocument {
    file_id: String,
}

impl TelegramDelivery {
    /// Creates a delivery client for the given bot token.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Client`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .user_agent(user_agent::default_user_agent())
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(DeliveryError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn upload_file(
        &self,
        requester: RequesterId,
        path: &Path,
    ) -> Result<ArtifactId, DeliveryError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| DeliveryError::io(path, e))?;
        let file_name = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());

        debug!(path = %path.display(), bytes = data.len(), "uploading document");

        let form = Form::new()
            .text("chat_id", requester.to_string())
            .part("document", Part::bytes(data).file_name(file_name));

        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| DeliveryError::transport("sendDocument", e))?;

        document_id(parse_response::<SentMessage>("sendDocument", response).await?)
    }

    async fn resend_artifact(
        &self,
        requester: RequesterId,
        artifact: &ArtifactId,
    ) -> Result<ArtifactId, DeliveryError> {
        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .json(&json!({ "chat_id": requester.0, "document": artifact.as_str() }))
            .send()
            .await
            .map_err(|e| DeliveryError::transport("sendDocument", e))?;

        document_id(parse_response::<SentMessage>("sendDocument", response).await?)
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    #[instrument(skip(self, attachments), fields(requester = %requester, count = attachments.len()))]
    async fn deliver(
        &self,
        requester: RequesterId,
        attachments: &[Attachment],
    ) -> Result<Vec<ArtifactId>, DeliveryError> {
        let mut ids = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let id = match attachment {
                Attachment::File(path) => self.upload_file(requester, path).await?,
                Attachment::Artifact(artifact) => self.resend_artifact(requester, artifact).await?,
            };
            ids.push(id);
        }

        if attachments.len() > 1 {
            self.notify(requester, REASSEMBLY_INSTRUCTIONS).await?;
        }

        info!(delivered = ids.len(), "attachments delivered");
        Ok(ids)
    }

    #[instrument(skip(self, text), fields(requester = %requester))]
    async fn notify(&self, requester: RequesterId, text: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({ "chat_id": requester.0, "text": text }))
            .send()
            .await
            .map_err(|e| DeliveryError::transport("sendMessage", e))?;

        parse_response::<serde_json::Value>("sendMessage", response).await?;
        Ok(())
    }
}

async fn parse_response<T: for<'de> Deserialize<'de>>(
    method: &'static str,
    response: reqwest::Response,
) -> Result<T, DeliveryError> {
    let status = response.status();
    let body: ApiResponse<T> = match response.json().await {
        Ok(body) => body,
        Err(e) if status.is_success() => {
            return Err(DeliveryError::malformed(method, e.without_url().to_string()));
        }
        Err(_) => {
            return Err(DeliveryError::api(
                method,
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown"),
            ));
        }
    };

    if !status.is_success() || !body.ok {
        let retry_after = body
            .parameters
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs);
        return Err(DeliveryError::api_with_retry_after(
            method,
            status.as_u16(),
            body.description.unwrap_or_else(|| "no description".to_string()),
            retry_after,
        ));
    }

    body.result
        .ok_or_else(|| DeliveryError::malformed(method, "missing result"))
}

fn document_id(message: SentMessage) -> Result<ArtifactId, DeliveryError> {
    message
        .document
        .map(|d| ArtifactId(d.file_id))
        .ok_or_else(|| DeliveryError::malformed("sendDocument", "message has no document"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn delivery(base_url: &str) -> TelegramDelivery {
        TelegramDelivery::new(
            base_url,
            "123:abc",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_method_url_includes_token() {
        let d = delivery("https://api.telegram.org/");
        assert_eq!(
            d.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn test_document_id_extracts_file_id() {
        let message: SentMessage =
            serde_json::from_str(r#"{"document": {"file_id": "BQAC", "file_size": 10}}"#).unwrap();
        assert_eq!(document_id(message).unwrap(), ArtifactId::from("BQAC"));
    }

    #[test]
    fn test_document_id_missing_document_is_malformed() {
        let message: SentMessage = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert!(matches!(
            document_id(message),
            Err(DeliveryError::Malformed { .. })
        ));
    }

    #[test]
    fn test_reassembly_instructions_mention_parts() {
        assert!(REASSEMBLY_INSTRUCTIONS.contains(".partNN"));
    }
}
