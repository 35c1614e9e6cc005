//! Queues pair a named configuration with a processor for one payload type.
//!
//! The dispatcher is intentionally unaware of payload types: it sees a queue
//! only through the [`Queue`] capability, which exposes the configuration and
//! a `receive` entry point taking raw payload bytes. Decoding is concealed
//! behind `receive`, so each queue remains strongly typed at its edge while
//! the engine stays uniform.
//!
//! Most applications will define a [`Job`] type and wrap a processor closure
//! with [`JobQueue`]:
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use quern::{Job, JobQueue, QueueConfig};
//!
//! #[derive(Deserialize, Serialize)]
//! struct WelcomeEmail {
//!     user_id: i64,
//! }
//!
//! impl Job for WelcomeEmail {
//!     fn config() -> QueueConfig {
//!         QueueConfig::new("welcome-email").max_attempts(3)
//!     }
//! }
//!
//! let queue = JobQueue::new(|_cx, WelcomeEmail { user_id }| async move {
//!     println!("sending welcome email to user {user_id}");
//!     Ok(())
//! });
//! # let _ = queue;
//! ```

use std::{future::Future, pin::Pin, sync::Arc};

use jiff::SignedDuration;
use serde::{de::DeserializeOwned, Serialize};

use crate::client::Context;

/// The error type processors may return.
///
/// Anything displayable converts in; only the rendered message survives into
/// the completion record.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The boxed future returned by [`Queue::receive`].
pub type ReceiveFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send + 'a>>;

/// Configuration options for a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name of the queue. Must be unique per client.
    pub name: String,

    /// Maximum number of attempts before the task is marked as completed.
    pub max_attempts: i64,

    /// Duration the processor is given per attempt, if bounded.
    pub timeout: Option<SignedDuration>,

    /// Delay before a failed task becomes eligible for retry.
    pub backoff: SignedDuration,

    /// Whether and how completed tasks are retained in the database.
    ///
    /// If `None`, no completed tasks are retained.
    pub retention: Option<Retention>,
}

const DEFAULT_BACKOFF: SignedDuration = SignedDuration::from_secs(10);

impl QueueConfig {
    /// Creates a configuration for the named queue with a single attempt, no
    /// timeout, a ten-second backoff, and no retention.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: 1,
            timeout: None,
            backoff: DEFAULT_BACKOFF,
            retention: None,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Bounds each attempt to the given duration.
    pub fn timeout(mut self, timeout: SignedDuration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the delay applied before a failed task is retried.
    pub fn backoff(mut self, backoff: SignedDuration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Retains completed tasks according to the given policy.
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = Some(retention);
        self
    }
}

/// Policy for retaining completed tasks in the database.
#[derive(Debug, Clone, Default)]
pub struct Retention {
    /// How long to keep a completion row.
    ///
    /// If omitted, rows are kept forever.
    pub duration: Option<SignedDuration>,

    /// Only keep rows for tasks that failed.
    pub only_failed: bool,

    /// Whether the task payload is included in the completion row.
    ///
    /// If `None`, payloads are not retained.
    pub data: Option<RetainData>,
}

/// Policy for retaining task payload data after completion.
#[derive(Debug, Clone, Default)]
pub struct RetainData {
    /// Only retain payloads of tasks that failed.
    pub only_failed: bool,
}

/// The capability the dispatcher requires of a queue.
///
/// Implement this directly to take control of payload decoding; otherwise
/// prefer [`JobQueue`].
pub trait Queue: Send + Sync + 'static {
    /// Returns the configuration for this queue.
    fn config(&self) -> &QueueConfig;

    /// Decodes the payload and processes it to completion.
    fn receive(&self, cx: Context, payload: Vec<u8>) -> ReceiveFuture<'_>;
}

/// A task payload with an associated queue configuration.
pub trait Job: DeserializeOwned + Serialize + Send + 'static {
    /// Returns the configuration of the queue this job belongs to.
    fn config() -> QueueConfig;
}

type Processor<T> =
    Arc<dyn Fn(Context, T) -> Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send>> + Send + Sync>;

/// A type-safe [`Queue`] over a [`Job`], processing payloads with a closure.
pub struct JobQueue<T: Job> {
    config: QueueConfig,
    processor: Processor<T>,
}

impl<T: Job> JobQueue<T> {
    /// Creates a queue for `T` which hands decoded payloads to `processor`.
    pub fn new<F, Fut>(processor: F) -> Self
    where
        F: Fn(Context, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
    {
        Self {
            config: T::config(),
            processor: Arc::new(move |cx, job| Box::pin(processor(cx, job))),
        }
    }
}

impl<T: Job> Queue for JobQueue<T> {
    fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn receive(&self, cx: Context, payload: Vec<u8>) -> ReceiveFuture<'_> {
        Box::pin(async move {
            let job: T = serde_json::from_slice(&payload)?;
            (self.processor)(cx, job).await
        })
    }
}
