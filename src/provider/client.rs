//! HTTP client for the remote resource provider.
//!
//! Every outbound call, including polling and the final byte download, goes
//! through one shared [`Throttle`] so the request rate stays capped for the
//! whole process.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::ProviderError;
use super::resource::{RawResource, ResourceMetadata};
use super::throttle::Throttle;
use crate::user_agent;

/// Default provider API root.
pub const DEFAULT_API_BASE_URL: &str = "https://cloud-api.yandex.net/v1/disk/";

/// Default provider folder that staged public files are copied into.
pub const DEFAULT_STAGING_DIR: &str = "/Загрузки";

/// Default interval between staging-operation status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default deadline for a staging operation to reach a terminal status.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Lazily evaluated, non-restartable sequence of downloaded byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Connection settings for [`ProviderClient`].
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API root; endpoint paths are joined onto it.
    pub base_url: String,
    /// OAuth token; empty means anonymous access.
    pub token: String,
    /// Provider folder that staged files land in.
    pub staging_dir: String,
    /// Interval between staging-operation polls.
    pub poll_interval: Duration,
    /// Deadline for a staging operation.
    pub operation_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Idle read timeout (per read, not per request).
    pub read_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            token: String::new(),
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
        }
    }
}

/// A file copied into the account's private storage, ready for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// File name inside the staging folder.
    pub name: String,
    /// Full provider path of the staged copy.
    pub remote_path: String,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
}

/// Rate-limited client for the provider's HTTP surface.
///
/// Cheap to clone; clones share the connection pool and the throttle.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: Client,
    base_url: Url,
    staging_dir: String,
    poll_interval: Duration,
    operation_timeout: Duration,
    throttle: Arc<Throttle>,
}

impl ProviderClient {
    /// Creates a client from settings and a shared throttle.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidUrl`] if the base URL does not parse,
    /// or [`ProviderError::Client`] if the HTTP client cannot be built.
    pub fn new(config: ProviderConfig, throttle: Arc<Throttle>) -> Result<Self, ProviderError> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|_| ProviderError::invalid_url(&base))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !config.token.is_empty() {
            let value = HeaderValue::from_str(&format!("OAuth {}", config.token))
                .map_err(|_| ProviderError::malformed(base_url.as_str(), "token is not a valid header value"))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .default_headers(headers)
            .build()
            .map_err(ProviderError::Client)?;

        debug!(
            base_url = %base_url,
            throttle_ms = throttle.interval().as_millis(),
            "creating provider client"
        );

        Ok(Self {
            client,
            base_url,
            staging_dir: config.staging_dir.trim_end_matches('/').to_string(),
            poll_interval: config.poll_interval,
            operation_timeout: config.operation_timeout,
            throttle,
        })
    }

    /// Returns the shared throttle.
    #[must_use]
    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Fetches metadata (and the listing, for directories) of `path` inside a public resource.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport failure, non-2xx status, or a
    /// body that does not describe a resource.
    #[instrument(skip(self), fields(resource_key = %resource_key, path = %path))]
    pub async fn resolve_metadata(
        &self,
        resource_key: &str,
        path: &str,
    ) -> Result<ResourceMetadata, ProviderError> {
        let url = self.endpoint("public/resources")?;
        let response = self
            .execute(
                Method::GET,
                url.clone(),
                &[("public_key", resource_key), ("path", path)],
            )
            .await?;

        let raw: RawResource = read_json(url.as_str(), response).await?;
        ResourceMetadata::try_from(raw).map_err(|reason| ProviderError::malformed(url.as_str(), reason))
    }

    /// Copies a publicly shared file into the account's staging folder.
    ///
    /// When the provider answers with an asynchronous operation, its status
    /// endpoint is polled until it reports success or failure, bounded by the
    /// configured operation timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::OperationFailed`] or
    /// [`ProviderError::OperationTimedOut`] for terminal operation outcomes,
    /// and other [`ProviderError`] variants for request-level failures.
    #[instrument(skip(self), fields(resource_key = %resource_key, path = %path))]
    pub async fn save_to_recipient_storage(
        &self,
        resource_key: &str,
        path: &str,
    ) -> Result<StagedFile, ProviderError> {
        let name = match staged_name(path) {
            Some(name) => name.to_string(),
            None => self.resolve_metadata(resource_key, path).await?.name,
        };

        let url = self.endpoint("public/resources/save-to-disk")?;
        let response = self
            .execute(
                Method::POST,
                url.clone(),
                &[
                    ("public_key", resource_key),
                    ("path", path),
                    ("force_async", "false"),
                ],
            )
            .await?;

        if response.status() == StatusCode::ACCEPTED {
            let link: Link = read_json(url.as_str(), response).await?;
            self.wait_for_operation(&link.href).await?;
        } else {
            debug!(status = response.status().as_u16(), "saved synchronously");
        }

        let remote_path = format!("{}/{}", self.staging_dir, name);
        info!(remote_path = %remote_path, "file staged");
        Ok(StagedFile { name, remote_path })
    }

    /// Polls an operation status URL until it reaches a terminal status.
    async fn wait_for_operation(&self, status_href: &str) -> Result<(), ProviderError> {
        let operation = status_href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(status_href)
            .to_string();
        let url = Url::parse(status_href).map_err(|_| ProviderError::invalid_url(status_href))?;
        let started = Instant::now();

        loop {
            let response = self.execute(Method::GET, url.clone(), &[]).await?;
            let status: OperationStatus = read_json(url.as_str(), response).await?;

            match status.status.as_str() {
                "success" => {
                    debug!(operation = %operation, "operation finished");
                    return Ok(());
                }
                "failed" => {
                    warn!(operation = %operation, "provider reported operation failure");
                    return Err(ProviderError::OperationFailed { operation });
                }
                other => {
                    let waited = started.elapsed();
                    if waited + self.poll_interval > self.operation_timeout {
                        warn!(
                            operation = %operation,
                            waited_secs = waited.as_secs(),
                            "operation polling deadline reached"
                        );
                        return Err(ProviderError::OperationTimedOut { operation, waited });
                    }
                    debug!(operation = %operation, status = other, "operation still running");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Obtains a signed download URL for a staged file.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on request failure or a body without `href`.
    #[instrument(skip(self), fields(remote_path = %staged.remote_path))]
    pub async fn get_download_link(&self, staged: &StagedFile) -> Result<String, ProviderError> {
        let url = self.endpoint("resources/download")?;
        let response = self
            .execute(
                Method::GET,
                url.clone(),
                &[("path", staged.remote_path.as_str()), ("fields", "href")],
            )
            .await?;

        let link: Link = read_json(url.as_str(), response).await?;
        Ok(link.href)
    }

    /// Starts downloading `url` and returns its body as chunks of at most `buffer_size` bytes.
    ///
    /// The stream is finite and cannot be restarted; call again to re-download.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the request fails before the body starts.
    /// Failures mid-body surface as `Err` items of the stream.
    pub async fn stream_download(
        &self,
        url: &str,
        buffer_size: usize,
    ) -> Result<ByteStream, ProviderError> {
        let parsed = Url::parse(url).map_err(|_| ProviderError::invalid_url(url))?;
        let response = self.execute(Method::GET, parsed, &[]).await?;

        let url = url.to_string();
        let buffer_size = buffer_size.max(1);
        let chunks = response.bytes_stream().flat_map(move |chunk| {
            let pieces: Vec<Result<Bytes, ProviderError>> = match chunk {
                Ok(bytes) => rechunk(bytes, buffer_size).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(ProviderError::transport(url.clone(), e))],
            };
            stream::iter(pieces)
        });

        Ok(Box::pin(chunks))
    }

    /// Streams `url` into `destination`, replacing any existing file.
    ///
    /// Removes the partial file if the transfer fails.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] for request, stream, or file system failures.
    #[instrument(skip(self, url), fields(destination = %destination.display()))]
    pub async fn download_to_file(
        &self,
        url: &str,
        destination: &Path,
        buffer_size: usize,
    ) -> Result<u64, ProviderError> {
        if tokio::fs::try_exists(destination).await.unwrap_or(false) {
            warn!("download destination already exists, overwriting");
        }

        let chunks = self.stream_download(url, buffer_size).await?;
        let file = File::create(destination)
            .await
            .map_err(|e| ProviderError::io(destination, e))?;

        let result = write_chunks(file, chunks, destination, buffer_size).await;
        if result.is_err() {
            debug!("cleaning up partial file after error");
            let _ = tokio::fs::remove_file(destination).await;
        }

        let bytes = result?;
        info!(bytes, "download complete");
        Ok(bytes)
    }

    /// Permanently deletes a staged file from the account's storage.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on request failure; callers treat this as best-effort.
    #[instrument(skip(self), fields(remote_path = %staged.remote_path))]
    pub async fn delete_staged(&self, staged: &StagedFile) -> Result<(), ProviderError> {
        let url = self.endpoint("resources")?;
        self.execute(
            Method::DELETE,
            url,
            &[
                ("path", staged.remote_path.as_str()),
                ("force_async", "false"),
                ("permanently", "true"),
            ],
        )
        .await?;
        debug!("staged file deleted");
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|_| ProviderError::invalid_url(format!("{}{path}", self.base_url)))
    }

    /// Waits on the throttle, sends the request, and rejects non-success statuses.
    async fn execute(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<Response, ProviderError> {
        self.throttle.acquire().await;

        let response = self
            .client
            .request(method, url.clone())
            .query(query)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "provider request failed");
                ProviderError::transport(url.as_str(), e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            warn!(url = %url, status = status.as_u16(), "provider returned error status");
            return Err(ProviderError::http_status_with_retry_after(
                url.as_str(),
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Name a staged copy of `path` will have: its last non-empty segment.
fn staged_name(path: &str) -> Option<&str> {
    path.rsplit('/').find(|segment| !segment.is_empty())
}

/// Splits a chunk into pieces of at most `max` bytes without copying.
fn rechunk(mut bytes: Bytes, max: usize) -> Vec<Bytes> {
    let mut pieces = Vec::with_capacity(bytes.len() / max + 1);
    while bytes.len() > max {
        pieces.push(bytes.split_to(max));
    }
    if !bytes.is_empty() {
        pieces.push(bytes);
    }
    pieces
}

async fn write_chunks(
    file: File,
    mut chunks: ByteStream,
    destination: &Path,
    buffer_size: usize,
) -> Result<u64, ProviderError> {
    let mut writer = BufWriter::with_capacity(buffer_size.max(1), file);
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| ProviderError::io(destination, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| ProviderError::io(destination, e))?;

    Ok(bytes_written)
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    url: &str,
    response: Response,
) -> Result<T, ProviderError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| ProviderError::transport(url, e))?;
    serde_json::from_slice(&body).map_err(|e| ProviderError::malformed(url, e.to_string()))
}
