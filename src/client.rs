//! Clients own the database pool, the queue registry, and the dispatcher.
//!
//! A [`Client`] is a cheap-to-clone handle. Typical usage registers one
//! [`JobQueue`](crate::JobQueue) per job type, starts the dispatcher, and
//! enqueues work from anywhere in the application:
//!
//! ```rust,no_run
//! use jiff::SignedDuration;
//! use serde::{Deserialize, Serialize};
//! use sqlx::SqlitePool;
//! use quern::{Client, Job, JobQueue, QueueConfig};
//!
//! #[derive(Deserialize, Serialize)]
//! struct SendReceipt {
//!     order_id: i64,
//! }
//!
//! impl Job for SendReceipt {
//!     fn config() -> QueueConfig {
//!         QueueConfig::new("send-receipt").max_attempts(3)
//!     }
//! }
//!
//! # use tokio::runtime::Runtime;
//! # fn main() {
//! # let rt = Runtime::new().unwrap();
//! # rt.block_on(async {
//! let pool = SqlitePool::connect("sqlite://queue.db").await?;
//! quern::run_migrations(&pool).await?;
//!
//! let client = Client::builder()
//!     .pool(pool)
//!     .num_workers(4)
//!     .release_after(SignedDuration::from_secs(300))
//!     .build()?;
//!
//! client.register(JobQueue::new(|_cx, SendReceipt { order_id }| async move {
//!     println!("sending receipt for order {order_id}");
//!     Ok(())
//! }))?;
//!
//! client.start();
//! client.enqueue(&SendReceipt { order_id: 42 }).await?;
//!
//! client.stop(SignedDuration::from_secs(30)).await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! # }
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use builder_states::{Initial, PoolSet};
use jiff::SignedDuration;
use sqlx::{SqlitePool, SqliteExecutor};
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::Dispatcher,
    queue::{Job, Queue},
    task::{self, Task, TaskId},
    timestamp::Timestamp,
};

type Result<T = ()> = std::result::Result<T, Error>;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when serializing task
    /// payloads.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Indicates a queue with the same name is already registered.
    #[error("queue {0} is already registered")]
    QueueExists(String),

    /// Indicates no queue with the given name is registered.
    #[error("queue {0} is not registered")]
    UnknownQueue(String),

    /// Indicates the client was configured with an invalid option.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Handle to the task queue system.
///
/// Clones share the same pool, queue registry, and dispatcher.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    pool: SqlitePool,
    queues: RwLock<HashMap<String, Arc<dyn Queue>>>,
    dispatcher: Dispatcher,
}

impl Client {
    /// Creates a new builder.
    pub fn builder() -> ClientBuilder<Initial> {
        ClientBuilder::new()
    }

    /// Returns the underlying connection pool.
    ///
    /// Useful for inspection surfaces and for wrapping enqueues in your own
    /// transactions.
    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    /// Registers a queue so the dispatcher can route its tasks.
    ///
    /// Queue names must be unique.
    pub fn register<Q: Queue>(&self, queue: Q) -> Result {
        let name = queue.config().name.clone();

        let mut queues = self.inner.queues.write().unwrap();
        if queues.contains_key(&name) {
            return Err(Error::QueueExists(name));
        }
        queues.insert(name, Arc::new(queue));

        Ok(())
    }

    pub(crate) fn queue(&self, name: &str) -> Option<Arc<dyn Queue>> {
        self.inner.queues.read().unwrap().get(name).cloned()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Enqueues a job for execution as soon as a worker is available.
    pub async fn enqueue<T: Job>(&self, job: &T) -> Result<TaskId> {
        let id = self.enqueue_using(&self.inner.pool, job).await?;
        self.notify();
        Ok(id)
    }

    /// Enqueues a job that will not be executed before `wait_until`.
    pub async fn enqueue_at<T: Job>(&self, job: &T, wait_until: Timestamp) -> Result<TaskId> {
        let id = self
            .enqueue_at_using(&self.inner.pool, job, wait_until)
            .await?;
        self.notify();
        Ok(id)
    }

    /// Same as [`enqueue`](Self::enqueue), but the row is written via the
    /// provided executor so the enqueue can participate in a caller
    /// transaction.
    ///
    /// The dispatcher is not signalled; call [`notify`](Self::notify) once
    /// the transaction has committed.
    pub async fn enqueue_using<'a, T, E>(&self, executor: E, job: &T) -> Result<TaskId>
    where
        T: Job,
        E: SqliteExecutor<'a>,
    {
        self.insert_task(executor, job, None).await
    }

    /// Same as [`enqueue_at`](Self::enqueue_at), but via the provided
    /// executor; see [`enqueue_using`](Self::enqueue_using).
    pub async fn enqueue_at_using<'a, T, E>(
        &self,
        executor: E,
        job: &T,
        wait_until: Timestamp,
    ) -> Result<TaskId>
    where
        T: Job,
        E: SqliteExecutor<'a>,
    {
        self.insert_task(executor, job, Some(wait_until)).await
    }

    async fn insert_task<'a, T, E>(
        &self,
        executor: E,
        job: &T,
        wait_until: Option<Timestamp>,
    ) -> Result<TaskId>
    where
        T: Job,
        E: SqliteExecutor<'a>,
    {
        let config = T::config();
        if self.queue(&config.name).is_none() {
            return Err(Error::UnknownQueue(config.name));
        }

        let task = Task {
            id: TaskId::new(),
            queue: config.name,
            task: serde_json::to_vec(job)?,
            created_at: Timestamp::now(),
            wait_until,
            claimed_at: None,
            last_executed_at: None,
            attempts: 0,
        };

        task::insert_pending(executor, &task).await?;

        tracing::debug!(task.id = %task.id, task.queue = %task.queue, "task enqueued");

        Ok(task.id)
    }

    /// Hints to the dispatcher that new work may be available.
    ///
    /// Non-blocking, and only effective while the dispatcher is running.
    /// Needed directly only after committing a transaction that used one of
    /// the `*_using` enqueues.
    pub fn notify(&self) {
        self.inner.dispatcher.notify();
    }

    /// Starts the dispatcher.
    ///
    /// Returns a token that hard-cancels the dispatcher when cancelled:
    /// every loop stops at its next suspension point and in-flight outcomes
    /// may be lost. For an orderly shutdown use [`stop`](Self::stop).
    ///
    /// Calling `start` while the dispatcher is running is a no-op and
    /// returns the token of the running instance.
    pub fn start(&self) -> CancellationToken {
        self.inner.dispatcher.start(self, CancellationToken::new())
    }

    /// Gracefully stops the dispatcher.
    ///
    /// Ready tasks are drained and in-flight tasks are given until `timeout`
    /// to report their outcome. Returns whether the drain completed; on
    /// `false`, tasks still claimed will be reclaimed by a future run once
    /// their claim expires.
    ///
    /// Calling `stop` while the dispatcher is not running is a no-op.
    pub async fn stop(&self, timeout: SignedDuration) -> bool {
        self.inner.dispatcher.stop(timeout).await
    }
}

/// Execution context handed to processors.
///
/// Carries a [`Client`] so processors can enqueue follow-up work.
#[derive(Clone)]
pub struct Context {
    client: Client,
    task_id: TaskId,
    attempt: i64,
}

impl Context {
    pub(crate) fn new(client: Client, task_id: TaskId, attempt: i64) -> Self {
        Self {
            client,
            task_id,
            attempt,
        }
    }

    /// Returns the client this task was dispatched from.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the id of the task being processed.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Returns the number of this attempt, starting at 1.
    pub fn attempt(&self) -> i64 {
        self.attempt
    }
}

mod builder_states {
    use jiff::SignedDuration;
    use sqlx::SqlitePool;

    pub struct Initial;

    pub struct PoolSet {
        pub pool: SqlitePool,
        pub num_workers: usize,
        pub release_after: SignedDuration,
        pub cleanup_interval: Option<SignedDuration>,
    }
}

/// Builder for [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder<S> {
    state: S,
}

impl ClientBuilder<Initial> {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self { state: Initial }
    }

    /// Sets the connection pool.
    pub fn pool(self, pool: SqlitePool) -> ClientBuilder<PoolSet> {
        ClientBuilder {
            state: PoolSet {
                pool,
                num_workers: 1,
                release_after: SignedDuration::from_secs(15 * 60),
                cleanup_interval: None,
            },
        }
    }
}

impl ClientBuilder<PoolSet> {
    /// Sets the number of workers executing tasks concurrently.
    ///
    /// Defaults to `1`.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.state.num_workers = num_workers;
        self
    }

    /// Sets how long a claim on a task is honored before the task may be
    /// reclaimed by a dispatcher.
    ///
    /// Defaults to fifteen minutes.
    pub fn release_after(mut self, release_after: SignedDuration) -> Self {
        self.state.release_after = release_after;
        self
    }

    /// Enables periodic deletion of expired completion rows at the given
    /// interval.
    ///
    /// Disabled by default; a zero interval also disables it.
    pub fn cleanup_interval(mut self, cleanup_interval: SignedDuration) -> Self {
        self.state.cleanup_interval = Some(cleanup_interval);
        self
    }

    /// Builds the client.
    pub fn build(self) -> Result<Client> {
        let state = self.state;

        if state.num_workers == 0 {
            return Err(Error::InvalidConfig("num_workers must be greater than zero"));
        }

        if state.release_after <= SignedDuration::ZERO {
            return Err(Error::InvalidConfig("release_after must be positive"));
        }

        let cleanup_interval = match state.cleanup_interval {
            Some(interval) if interval < SignedDuration::ZERO => {
                return Err(Error::InvalidConfig("cleanup_interval must not be negative"))
            }
            Some(interval) if interval.is_zero() => None,
            interval => interval,
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                pool: state.pool,
                queues: RwLock::new(HashMap::new()),
                dispatcher: Dispatcher::new(
                    state.num_workers,
                    state.release_after,
                    cleanup_interval,
                ),
            }),
        })
    }
}
