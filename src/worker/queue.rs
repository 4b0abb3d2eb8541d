//! In-process request queue shared by the worker pool.
//!
//! A bounded FIFO with a shared receiving end. Each request is counted as
//! outstanding from enqueue until a worker reports it finished or dropped;
//! requeued requests stay outstanding, so [`TaskQueue::join`] only resolves
//! once every request has reached a terminal state.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delivery::RequesterId;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue has been closed for shutdown.
    #[error("queue is closed")]
    Closed,
}

/// Errors parsing an ingress line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestParseError {
    /// Fewer than three fields.
    #[error("expected `<requester_id> <resource_key> <path>`, got {0:?}")]
    MissingFields(String),

    /// The requester id is not an integer.
    #[error("invalid requester id {0:?}")]
    InvalidRequester(String),
}

/// A user's request for one file inside a shared resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Who asked, and who receives the parts.
    pub requester: RequesterId,
    /// Public key or URL of the shared resource.
    pub resource_key: String,
    /// Path of the file within the resource.
    pub path: String,
}

impl Request {
    /// Creates a request.
    #[must_use]
    pub fn new(
        requester: RequesterId,
        resource_key: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            requester,
            resource_key: resource_key.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.requester, self.resource_key, self.path)
    }
}

/// Parses `<requester_id> <resource_key> <path>`; the path may contain spaces.
impl FromStr for Request {
    type Err = RequestParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let missing = || RequestParseError::MissingFields(line.to_string());

        let (requester, rest) = line
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(missing)?;
        let (resource_key, path) = rest
            .trim_start()
            .split_once(char::is_whitespace)
            .ok_or_else(missing)?;
        let path = path.trim_start();
        if path.is_empty() {
            return Err(missing());
        }

        let requester = requester
            .parse::<i64>()
            .map_err(|_| RequestParseError::InvalidRequester(requester.to_string()))?;

        Ok(Self::new(RequesterId(requester), resource_key, path))
    }
}

/// A request together with its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique for the life of the queue.
    pub id: u64,
    /// The immutable request.
    pub request: Request,
    /// 1-indexed number of the attempt this job represents.
    pub attempt: u32,
}

/// Bounded FIFO of [`Job`]s with outstanding-work tracking.
#[derive(Debug)]
pub struct TaskQueue {
    sender: mpsc::Sender<Job>,
    receiver: Mutex<mpsc::Receiver<Job>>,
    outstanding: watch::Sender<usize>,
    next_id: AtomicU64,
}

impl TaskQueue {
    /// Creates a queue holding at most `capacity` waiting jobs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (outstanding, _) = watch::channel(0);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            outstanding,
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a new request, waiting for space if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`close`](Self::close).
    pub async fn enqueue(&self, request: Request) -> Result<u64, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outstanding.send_modify(|n| *n += 1);

        let job = Job {
            id,
            request,
            attempt: 1,
        };
        if self.sender.send(job).await.is_err() {
            self.task_done();
            return Err(QueueError::Closed);
        }

        debug!(job_id = id, "enqueued");
        Ok(id)
    }

    /// Puts a job back for another attempt. It stays outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after [`close`](Self::close); the job is
    /// then no longer outstanding.
    pub async fn requeue(&self, job: Job) -> Result<(), QueueError> {
        let id = job.id;
        if self.sender.send(job).await.is_err() {
            self.task_done();
            return Err(QueueError::Closed);
        }
        debug!(job_id = id, "requeued");
        Ok(())
    }

    /// Waits for the next job, or returns `None` once `cancel` fires or the
    /// queue is closed and drained.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Job> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            job = async { self.receiver.lock().await.recv().await } => job,
        }
    }

    /// Marks one outstanding job as finished or dropped.
    pub fn task_done(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Number of jobs enqueued and not yet finished or dropped.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Number of jobs waiting to be picked up.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Returns `true` if no job is waiting to be picked up.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once no job is outstanding.
    pub async fn join(&self) {
        let mut outstanding = self.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    /// Stops accepting jobs. Jobs already waiting can still be received.
    pub async fn close(&self) {
        self.receiver.lock().await.close();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
