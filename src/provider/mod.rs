//! Client for the remote public-resource provider.
//!
//! The provider exposes publicly shared files by a resource key. Fetching one
//! takes four requests: stage the file into the account's own storage, ask
//! for a signed download link, stream the bytes, and delete the staged copy.
//! All of them pass through one process-wide [`Throttle`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use relay_core::provider::{ProviderClient, ProviderConfig, Throttle};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let throttle = Arc::new(Throttle::per_period(35, Duration::from_secs(1)));
//! let client = ProviderClient::new(ProviderConfig::default(), throttle)?;
//! let meta = client
//!     .resolve_metadata("https://disk.yandex.ru/d/abc", "/movie.mkv")
//!     .await?;
//! println!("{} modified at {}", meta.name, meta.modified_time);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod resource;
mod throttle;

pub use client::{
    ByteStream, DEFAULT_API_BASE_URL, DEFAULT_OPERATION_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_STAGING_DIR, ProviderClient, ProviderConfig, StagedFile,
};
pub use error::ProviderError;
pub use resource::{ResourceMetadata, parse_modified};
pub use throttle::{Throttle, parse_retry_after};
