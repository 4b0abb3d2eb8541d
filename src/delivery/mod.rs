//! Delivery of finished artifacts to the requesting user.
//!
//! The pipeline only depends on the [`Delivery`] trait. [`TelegramDelivery`]
//! is the production implementation that uploads documents through a chat
//! bot API and returns the bot's file identifiers, which the cache later
//! re-sends without touching the remote provider again.

mod error;
mod telegram;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::DeliveryError;
pub use telegram::{DEFAULT_BASE_URL, REASSEMBLY_INSTRUCTIONS, TelegramDelivery};

/// Opaque identifier of the user a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(pub i64);

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier the recipient assigned to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One item handed to [`Delivery::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// A local file that still has to be uploaded.
    File(PathBuf),
    /// A file the recipient already holds, re-sent by identifier.
    Artifact(ArtifactId),
}

/// Recipient-side collaborator that uploads files and sends notices.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Uploads each attachment in order and returns one identifier per attachment.
    ///
    /// Implementations are expected to tell the requester how to reassemble
    /// the parts when more than one part is delivered, whether uploaded fresh
    /// or re-sent from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] when any upload fails; attachments after the
    /// failing one are not sent.
    async fn deliver(
        &self,
        requester: RequesterId,
        attachments: &[Attachment],
    ) -> Result<Vec<ArtifactId>, DeliveryError>;

    /// Sends a plain text message to the requester.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] when the message cannot be sent.
    async fn notify(&self, requester: RequesterId, text: &str) -> Result<(), DeliveryError>;
}
