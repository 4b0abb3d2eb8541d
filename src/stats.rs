//! Append-only statistics for fulfilled requests.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::db::Database;

/// Statistics store errors.
#[derive(Debug, Error)]
pub enum StatsError {
    /// A query against the statistics table failed.
    #[error("statistics query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A value does not fit the table's integer columns.
    #[error("invalid statistics record: {reason}")]
    Invalid {
        /// What was wrong with the record.
        reason: String,
    },
}

/// One fulfilled request. Timestamps are epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StatisticsRecord {
    /// Resource key the request named.
    #[sqlx(rename = "public_key")]
    pub resource_key: String,
    /// Path within the resource.
    pub path: String,
    /// Downloaded bytes; zero for cache hits.
    #[sqlx(rename = "size")]
    pub byte_size: i64,
    /// When the worker picked the request up.
    pub start_time: i64,
    /// When delivery finished.
    pub end_time: i64,
}

impl StatisticsRecord {
    /// Builds a record, converting the byte count to the column type.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Invalid`] if `byte_size` exceeds `i64::MAX` or
    /// `end_time` precedes `start_time`.
    pub fn new(
        resource_key: impl Into<String>,
        path: impl Into<String>,
        byte_size: u64,
        start_time: i64,
        end_time: i64,
    ) -> Result<Self, StatsError> {
        let byte_size = i64::try_from(byte_size).map_err(|_| StatsError::Invalid {
            reason: format!("byte size {byte_size} out of range"),
        })?;
        if end_time < start_time {
            return Err(StatsError::Invalid {
                reason: format!("end time {end_time} precedes start time {start_time}"),
            });
        }
        Ok(Self {
            resource_key: resource_key.into(),
            path: path.into(),
            byte_size,
            start_time,
            end_time,
        })
    }
}

/// Durable sink for [`StatisticsRecord`]s.
#[derive(Debug, Clone)]
pub struct StatsSink {
    db: Database,
}

impl StatsSink {
    /// Wraps an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Query`] if the insert fails.
    #[instrument(skip(self, record), fields(path = %record.path, size = record.byte_size))]
    pub async fn record(&self, record: &StatisticsRecord) -> Result<i64, StatsError> {
        let result = sqlx::query(
            "INSERT INTO statistics (public_key, path, size, start_time, end_time) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.resource_key)
        .bind(&record.path)
        .bind(record.byte_size)
        .bind(record.start_time)
        .bind(record.end_time)
        .execute(self.db.pool())
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, "statistics recorded");
        Ok(id)
    }

    /// Total number of recorded requests.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Query`] if the query fails.
    pub async fn count(&self) -> Result<i64, StatsError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM statistics")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// The most recent `limit` records, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Query`] if the query fails.
    pub async fn recent(&self, limit: u32) -> Result<Vec<StatisticsRecord>, StatsError> {
        let rows = sqlx::query_as::<_, StatisticsRecord>(
            "SELECT public_key, path, size, start_time, end_time FROM statistics \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }
}
