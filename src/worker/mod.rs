//! Fixed-size worker pool draining the request queue.
//!
//! Each worker loops: take the next job, run it through the [`Pipeline`], and
//! settle the outcome. Failures are classified by [`classify_error`]; retryable
//! ones are put back on the queue after a backoff delay, the rest are dropped
//! and the requester gets [`FAILURE_NOTICE`]. A requeued job waits in its own
//! task, so a worker never sits on a sleeping retry.
//!
//! Shutdown is cooperative: [`WorkerPool::shutdown`] cancels the shared token,
//! and each worker exits after finishing the job it holds.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_core::delivery::RequesterId;
//! use relay_core::worker::{Pipeline, Request, RetryPolicy, TaskQueue, WorkerPool};
//!
//! # async fn example(pipeline: Pipeline) -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(TaskQueue::new(1024));
//! let pool = WorkerPool::start(4, Arc::clone(&queue), Arc::new(pipeline), RetryPolicy::default());
//!
//! queue
//!     .enqueue(Request::new(RequesterId(1), "https://disk.yandex.ru/d/abc", "/movie.mkv"))
//!     .await?;
//! queue.join().await;
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod pipeline;
mod queue;
mod retry;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub use error::RelayError;
pub use pipeline::{
    DEFAULT_BUFFER_SIZE, DEFAULT_VOLUME_SIZE, FAILURE_NOTICE, Outcome, Pipeline, PipelineConfig,
};
pub use queue::{
    DEFAULT_QUEUE_CAPACITY, Job, QueueError, Request, RequestParseError, TaskQueue,
};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, FailureType, RetryDecision,
    RetryPolicy, classify_error,
};

/// Counters describing what the pool has done so far.
#[derive(Debug, Default)]
pub struct PoolStats {
    delivered: AtomicUsize,
    cache_hits: AtomicUsize,
    requeued: AtomicUsize,
    dropped: AtomicUsize,
}

impl PoolStats {
    /// Creates a stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests fulfilled, cache hits included.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Requests fulfilled from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::SeqCst)
    }

    /// Retries scheduled.
    #[must_use]
    pub fn requeued(&self) -> usize {
        self.requeued.load(Ordering::SeqCst)
    }

    /// Requests given up on.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn increment_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle to the running workers.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    stats: Arc<PoolStats>,
}

struct Worker {
    id: usize,
    queue: Arc<TaskQueue>,
    pipeline: Arc<Pipeline>,
    retry: RetryPolicy,
    stats: Arc<PoolStats>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawns `workers` worker tasks (at least one) on the current runtime.
    #[must_use]
    pub fn start(
        workers: usize,
        queue: Arc<TaskQueue>,
        pipeline: Arc<Pipeline>,
        retry: RetryPolicy,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stats = Arc::new(PoolStats::new());
        let workers = workers.max(1);

        info!(workers, max_attempts = retry.max_attempts(), "starting worker pool");

        let handles = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&queue),
                    pipeline: Arc::clone(&pipeline),
                    retry: retry.clone(),
                    stats: Arc::clone(&stats),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run().instrument(info_span!("worker", worker = id)))
            })
            .collect();

        Self {
            handles,
            cancel,
            stats,
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Signals every worker to stop and waits for them to finish their
    /// current job.
    pub async fn shutdown(self) {
        info!("shutting down worker pool");
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!(
            delivered = self.stats.delivered(),
            cache_hits = self.stats.cache_hits(),
            requeued = self.stats.requeued(),
            dropped = self.stats.dropped(),
            "worker pool stopped"
        );
    }
}

impl Worker {
    async fn run(self) {
        debug!("worker started");
        while let Some(job) = self.queue.next(&self.cancel).await {
            self.handle(job).await;
        }
        debug!(worker = self.id, "worker stopped");
    }

    async fn handle(&self, job: Job) {
        match self.pipeline.process(&job).await {
            Ok(outcome) => {
                if let Outcome::CacheHit { .. } = outcome {
                    self.stats.increment_cache_hits();
                }
                self.stats.increment_delivered();
                info!(job_id = job.id, ?outcome, "request fulfilled");
                self.queue.task_done();
            }
            Err(e) => self.settle_failure(job, &e).await,
        }
    }

    async fn settle_failure(&self, mut job: Job, error: &RelayError) {
        match self.retry.decide(error, job.attempt) {
            RetryDecision::Retry { delay, attempt } => {
                warn!(
                    job_id = job.id,
                    attempt = job.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "transient failure, requeueing"
                );
                self.stats.increment_requeued();
                job.attempt = attempt;
                self.schedule_requeue(job, delay);
            }
            RetryDecision::DoNotRetry { reason } => {
                error!(
                    job_id = job.id,
                    attempt = job.attempt,
                    request = %job.request,
                    reason = %reason,
                    error = %error_chain(error),
                    "dropping request"
                );
                self.stats.increment_dropped();
                self.pipeline.notify_failure(job.request.requester).await;
                self.queue.task_done();
            }
        }
    }

    fn schedule_requeue(&self, job: Job, delay: std::time::Duration) {
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(job_id = job.id, "pool stopping, abandoning scheduled retry");
                    queue.task_done();
                }
                () = tokio::time::sleep(delay) => {
                    if let Err(e) = queue.requeue(job).await {
                        warn!(error = %e, "could not requeue request");
                    }
                }
            }
        });
    }
}

/// Renders an error and its sources as `outer: inner: innermost`.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;

    #[test]
    fn test_pool_stats_start_at_zero() {
        let stats = PoolStats::new();
        assert_eq!(stats.delivered(), 0);
        assert_eq!(stats.cache_hits(), 0);
        assert_eq!(stats.requeued(), 0);
        assert_eq!(stats.dropped(), 0);
    }

    #[test]
    fn test_pool_stats_increments() {
        let stats = PoolStats::new();
        stats.increment_delivered();
        stats.increment_delivered();
        stats.increment_cache_hits();
        stats.increment_requeued();
        stats.increment_dropped();
        assert_eq!(stats.delivered(), 2);
        assert_eq!(stats.cache_hits(), 1);
        assert_eq!(stats.requeued(), 1);
        assert_eq!(stats.dropped(), 1);
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let io = std::io::Error::other("disk full");
        let error = RelayError::from(ProviderError::io("/tmp/x", io));
        let chain = error_chain(&error);
        assert!(chain.starts_with("IO error writing to /tmp/x"));
        assert!(chain.ends_with(": disk full"));
    }
}
