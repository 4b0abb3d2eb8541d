//! The per-request fetch-or-reuse pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::RelayError;
use super::queue::{Job, Request};
use crate::archive;
use crate::cache::{Cache, CacheUpdate};
use crate::delivery::{ArtifactId, Attachment, Delivery, RequesterId};
use crate::fingerprint::Fingerprint;
use crate::provider::{ProviderClient, StagedFile};
use crate::stats::{StatisticsRecord, StatsSink};

/// Message sent to a requester whose request was dropped.
pub const FAILURE_NOTICE: &str = "Something unexpected went wrong while preparing your file. \
                                  Please report the details via /feedback.";

/// Default maximum part size, just under the recipient's attachment limit.
pub const DEFAULT_VOLUME_SIZE: u64 = 1_983_000;

/// Default read and write chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Local processing settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent of the per-request scratch directories.
    pub work_dir: PathBuf,
    /// Maximum bytes per delivered part.
    pub volume_size: u64,
    /// Chunk size for downloading and splitting.
    pub buffer_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("temp"),
            volume_size: DEFAULT_VOLUME_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// How a request was fulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Cached artifacts were re-sent without downloading anything.
    CacheHit {
        /// Number of artifacts re-sent.
        parts: usize,
    },
    /// The file was downloaded, packed, and uploaded.
    Fetched {
        /// Downloaded bytes.
        bytes: u64,
        /// Number of parts uploaded.
        parts: usize,
    },
}

/// Shared collaborators for processing requests.
///
/// One instance is shared by every worker; all state that must survive a
/// request lives in the cache and statistics store.
pub struct Pipeline {
    provider: ProviderClient,
    cache: Arc<Cache>,
    stats: StatsSink,
    delivery: Arc<dyn Delivery>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Wires the pipeline together.
    #[must_use]
    pub fn new(
        provider: ProviderClient,
        cache: Arc<Cache>,
        stats: StatsSink,
        delivery: Arc<dyn Delivery>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            stats,
            delivery,
            config,
        }
    }

    /// Fulfils one request: re-sends cached artifacts if they are still fresh,
    /// otherwise downloads, archives, splits, and uploads the file, then
    /// updates the cache. Either way a statistics record is written.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] for any failure; the caller decides whether to
    /// retry. The scratch directory is removed in all cases.
    #[instrument(skip(self, job), fields(job_id = job.id, attempt = job.attempt, path = %job.request.path))]
    pub async fn process(&self, job: &Job) -> Result<Outcome, RelayError> {
        let request = &job.request;
        let start_time = now();
        let fingerprint = Fingerprint::of(&request.resource_key, &request.path);

        let metadata = self
            .provider
            .resolve_metadata(&request.resource_key, &request.path)
            .await?;
        if metadata.is_directory {
            return Err(RelayError::NotAFile {
                path: request.path.clone(),
            });
        }

        if let Some(entry) = self
            .cache
            .fresh_entry(&fingerprint, metadata.modified_time)
            .await
        {
            info!(%fingerprint, parts = entry.artifact_ids.len(), "cache hit");
            let attachments: Vec<Attachment> = entry
                .artifact_ids
                .into_iter()
                .map(Attachment::Artifact)
                .collect();
            self.delivery
                .deliver(request.requester, &attachments)
                .await?;
            self.record(request, 0, start_time).await?;
            return Ok(Outcome::CacheHit {
                parts: attachments.len(),
            });
        }

        info!(%fingerprint, "cache miss, fetching");
        let scratch = self
            .config
            .work_dir
            .join(format!("{fingerprint}-{}", job.id));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| RelayError::io(&scratch, e))?;

        let result = self.fetch_and_deliver(job, &scratch).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(dir = %scratch.display(), error = %e, "failed to remove scratch directory");
        }

        let (bytes, artifact_ids) = result?;
        let parts = artifact_ids.len();

        self.cache
            .update(
                fingerprint,
                CacheUpdate::new(metadata.modified_time, artifact_ids),
            )
            .await?;
        self.record(request, bytes, start_time).await?;

        Ok(Outcome::Fetched { bytes, parts })
    }

    /// Tells the requester their request was dropped.
    pub async fn notify_failure(&self, requester: RequesterId) {
        if let Err(e) = self.delivery.notify(requester, FAILURE_NOTICE).await {
            warn!(%requester, error = %e, "failed to send failure notice");
        }
    }

    async fn fetch_and_deliver(
        &self,
        job: &Job,
        scratch: &Path,
    ) -> Result<(u64, Vec<ArtifactId>), RelayError> {
        let request = &job.request;
        let staged = self
            .provider
            .save_to_recipient_storage(&request.resource_key, &request.path)
            .await?;

        let downloaded = self.download_staged(&staged, scratch).await;
        if let Err(e) = self.provider.delete_staged(&staged).await {
            warn!(remote_path = %staged.remote_path, error = %e, "failed to delete staged file");
        }
        let (local_path, bytes) = downloaded?;

        let volume_size = self.config.volume_size;
        let buffer_size = self.config.buffer_size;
        let parts = tokio::task::spawn_blocking(move || {
            let archive_path = archive::archive(&local_path)?;
            archive::split(&archive_path, volume_size, buffer_size)
        })
        .await??;
        debug!(parts = parts.len(), "packed");

        let attachments: Vec<Attachment> = parts.into_iter().map(Attachment::File).collect();
        let artifact_ids = self
            .delivery
            .deliver(request.requester, &attachments)
            .await?;

        Ok((bytes, artifact_ids))
    }

    async fn download_staged(
        &self,
        staged: &StagedFile,
        scratch: &Path,
    ) -> Result<(PathBuf, u64), RelayError> {
        let link = self.provider.get_download_link(staged).await?;
        let local_path = scratch.join(local_file_name(&staged.name));
        let bytes = self
            .provider
            .download_to_file(&link, &local_path, self.config.buffer_size)
            .await?;
        Ok((local_path, bytes))
    }

    async fn record(
        &self,
        request: &Request,
        bytes: u64,
        start_time: i64,
    ) -> Result<(), RelayError> {
        let record = StatisticsRecord::new(
            request.resource_key.as_str(),
            request.path.as_str(),
            bytes,
            start_time,
            now().max(start_time),
        )?;
        self.stats.record(&record).await?;
        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Reduces a provider-supplied name to a single safe path component.
fn local_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_file_name_strips_directories() {
        assert_eq!(local_file_name("movie.mkv"), "movie.mkv");
        assert_eq!(local_file_name("../../etc/passwd"), "passwd");
        assert_eq!(local_file_name("/Загрузки/фильм.mkv"), "фильм.mkv");
    }

    #[test]
    fn test_local_file_name_falls_back_for_empty_names() {
        assert_eq!(local_file_name(""), "download");
        assert_eq!(local_file_name(".."), "download");
        assert_eq!(local_file_name("/"), "download");
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.volume_size, 1_983_000);
        assert_eq!(config.buffer_size, 65_536);
        assert_eq!(config.work_dir, PathBuf::from("temp"));
    }
}
