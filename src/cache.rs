//! Persisted cache of previously delivered artifacts.
//!
//! Maps a request [`Fingerprint`] to the modification time the resource had
//! when it was last fetched and the artifact identifiers the recipient
//! assigned to the uploaded parts. Entries never expire; a hit is honored only
//! while [`Cache::is_fresh`] holds against the live modification time.
//!
//! The whole table is rewritten on every mutation. Writes go to a sibling
//! temporary file that is then renamed over the cache file, so a crash
//! mid-write leaves the previous table intact.
//!
//! On-disk shape:
//!
//! ```text
//! { "<fingerprint>": { "files": ["<artifact id>", ...], "time": <epoch seconds> } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::delivery::ArtifactId;
use crate::fingerprint::Fingerprint;

/// Errors raised by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache file exists but cannot be read or parsed.
    #[error("cache file {path} is unreadable: {reason}")]
    Corrupted {
        /// Location of the cache file.
        path: PathBuf,
        /// Why it could not be loaded.
        reason: String,
    },

    /// Writing the cache file failed.
    #[error("failed to persist cache to {path}: {source}")]
    Io {
        /// Location being written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An update carried a value that cannot be stored.
    #[error("invalid cache entry for {fingerprint}: {reason}")]
    Validation {
        /// Entry being written.
        fingerprint: Fingerprint,
        /// What was wrong with it.
        reason: String,
    },
}

/// What the cache remembers about one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Identifiers of the delivered parts, in part order.
    #[serde(rename = "files", default)]
    pub artifact_ids: Vec<ArtifactId>,
    /// Resource modification time when the parts were produced (epoch seconds).
    #[serde(rename = "time")]
    pub last_modified: i64,
}

/// Caller-supplied values for [`Cache::update`], validated before storing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheUpdate {
    /// Modification time in epoch seconds; defaults to now when absent.
    pub last_modified: Option<f64>,
    /// Delivered artifact identifiers; defaults to empty when absent.
    pub artifact_ids: Option<Vec<ArtifactId>>,
}

impl CacheUpdate {
    /// Builds a complete update.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(last_modified: i64, artifact_ids: Vec<ArtifactId>) -> Self {
        Self {
            last_modified: Some(last_modified as f64),
            artifact_ids: Some(artifact_ids),
        }
    }
}

type Table = BTreeMap<Fingerprint, CacheEntry>;

/// Write-through, file-backed cache service.
///
/// Construct once at startup and share via `Arc`. The internal lock covers
/// each read-modify-persist cycle, so updates are atomic per fingerprint and
/// the file never sees interleaved writes.
#[derive(Debug)]
pub struct Cache {
    path: PathBuf,
    table: Mutex<Table>,
}

impl Cache {
    /// Loads the cache from `path`, creating an empty one if the file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupted`] if the file exists but cannot be read
    /// or parsed; callers must treat this as fatal. Returns [`CacheError::Io`]
    /// if a fresh empty cache cannot be written.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();

        let table = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<Table>(&raw).map_err(|e| CacheError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("cache file not found, creating a new one");
                let table = Table::new();
                persist(&path, &table).await?;
                table
            }
            Err(e) => {
                return Err(CacheError::Corrupted {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        info!(entries = table.len(), "cache loaded");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    /// Returns the backing file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the entry for `fingerprint`, if any.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.table.lock().await.get(fingerprint).cloned()
    }

    /// Returns `true` iff an entry exists, holds at least one artifact, and
    /// was produced no earlier than `current_modified` (the resource's live
    /// modification time).
    pub async fn is_fresh(&self, fingerprint: &Fingerprint, current_modified: i64) -> bool {
        self.fresh_entry(fingerprint, current_modified).await.is_some()
    }

    /// Returns the entry for `fingerprint` if it [is fresh](Self::is_fresh).
    pub async fn fresh_entry(
        &self,
        fingerprint: &Fingerprint,
        current_modified: i64,
    ) -> Option<CacheEntry> {
        let table = self.table.lock().await;
        let Some(entry) = table.get(fingerprint) else {
            debug!(fingerprint = %fingerprint, "not cached");
            return None;
        };

        if entry.artifact_ids.is_empty() {
            debug!(fingerprint = %fingerprint, "cache entry has no artifacts");
            None
        } else if entry.last_modified < current_modified {
            debug!(
                fingerprint = %fingerprint,
                cached = entry.last_modified,
                current = current_modified,
                "cache entry is outdated"
            );
            None
        } else {
            debug!(fingerprint = %fingerprint, "cache entry is up to date");
            Some(entry.clone())
        }
    }

    /// Validates `update`, replaces the entry for `fingerprint`, and persists the table.
    ///
    /// An absent `artifact_ids` becomes an empty list; an absent
    /// `last_modified` becomes the current time. The stored time is rounded
    /// up to whole seconds. The in-memory table only changes if persisting
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Validation`] for a non-finite or out-of-range
    /// time (nothing is written), or [`CacheError::Io`] if persisting fails.
    #[instrument(skip(self, update), fields(fingerprint = %fingerprint))]
    pub async fn update(
        &self,
        fingerprint: Fingerprint,
        update: CacheUpdate,
    ) -> Result<CacheEntry, CacheError> {
        let entry = validate(&fingerprint, update)?;

        let mut table = self.table.lock().await;
        if !table.contains_key(&fingerprint) {
            info!("new cache entry");
        }

        let mut next = table.clone();
        next.insert(fingerprint, entry.clone());
        persist(&self.path, &next).await?;
        *table = next;

        Ok(entry)
    }

    /// Removes the entry for `fingerprint` and persists the table.
    ///
    /// Returns the removed entry, or `None` if there was none.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if persisting fails.
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let removed = next.remove(fingerprint);
        persist(&self.path, &next).await?;
        *table = next;
        Ok(removed)
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }
}

fn validate(fingerprint: &Fingerprint, update: CacheUpdate) -> Result<CacheEntry, CacheError> {
    let artifact_ids = update.artifact_ids.unwrap_or_else(|| {
        warn!(fingerprint = %fingerprint, "artifact ids not specified, storing none");
        Vec::new()
    });

    let time = update.last_modified.unwrap_or_else(|| {
        warn!(fingerprint = %fingerprint, "time not specified, using current time");
        now_epoch_seconds()
    });

    Ok(CacheEntry {
        artifact_ids,
        last_modified: ceil_seconds(fingerprint, time)?,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn ceil_seconds(fingerprint: &Fingerprint, time: f64) -> Result<i64, CacheError> {
    if !time.is_finite() {
        return Err(CacheError::Validation {
            fingerprint: fingerprint.clone(),
            reason: format!("time must be finite, got {time}"),
        });
    }
    let rounded = time.ceil();
    if rounded < i64::MIN as f64 || rounded > i64::MAX as f64 {
        return Err(CacheError::Validation {
            fingerprint: fingerprint.clone(),
            reason: format!("time {time} is out of range"),
        });
    }
    Ok(rounded as i64)
}

#[allow(clippy::cast_precision_loss)]
fn now_epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

async fn persist(path: &Path, table: &Table) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let body = serde_json::to_vec(table).map_err(|e| io_err(std::io::Error::other(e)))?;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp_path, body).await.map_err(io_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(io_err)?;

    debug!(entries = table.len(), "cache persisted");
    Ok(())
}
