//! Disk Relay Core Library
//!
//! Fulfils requests for files inside publicly shared cloud-storage resources:
//! stage the file at the provider, download it, pack it into size-bounded zip
//! volumes, and hand the volumes to a chat recipient. Delivered artifact
//! identifiers are cached so repeated requests for an unchanged file are
//! answered without downloading it again.
//!
//! # Architecture
//!
//! - [`provider`] - Rate-limited client for the provider's HTTP surface
//! - [`cache`] - File-backed fingerprint → artifact cache
//! - [`archive`] - Zip archiving and volume splitting
//! - [`delivery`] - Recipient-side upload and notification
//! - [`stats`] - Append-only statistics store (on top of [`db`])
//! - [`worker`] - Request queue, pipeline, and worker pool

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod cache;
pub mod db;
pub mod delivery;
pub mod fingerprint;
pub mod provider;
pub mod stats;
pub mod worker;

mod user_agent;

// Re-export commonly used types
pub use cache::{Cache, CacheEntry, CacheError, CacheUpdate};
pub use db::{Database, DbError};
pub use delivery::{ArtifactId, Attachment, Delivery, DeliveryError, RequesterId, TelegramDelivery};
pub use fingerprint::Fingerprint;
pub use provider::{ProviderClient, ProviderConfig, ProviderError, Throttle};
pub use stats::{StatisticsRecord, StatsError, StatsSink};
pub use worker::{
    Pipeline, PipelineConfig, PoolStats, RelayError, Request, RetryPolicy, TaskQueue, WorkerPool,
};
