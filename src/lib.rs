//! # Quern
//!
//! ⚙️ Embedded task queues via SQLite.
//!
//! # Overview
//!
//! **Quern** runs typed background tasks inside your own process, persisting
//! them in the SQLite database you already ship. Application code enqueues
//! work; a dispatcher claims due tasks, executes them on a bounded pool of
//! workers, retries failures with backoff, and optionally retains completion
//! records for inspection.
//!
//! Key features:
//!
//! - **SQLite-backed**: tasks survive restarts and crashes; the claim
//!   protocol keeps delivery at-least-once with bounded attempts.
//! - **Typed queues**: payloads are plain `serde` types; decoding is
//!   concealed behind each queue's edge.
//! - **Event-driven dispatch**: enqueues signal the dispatcher directly and
//!   bursts coalesce into a single fetch, so there is no busy-polling.
//! - **Scheduled execution**: tasks may be deferred to a future instant; the
//!   dispatcher wakes exactly when the next one is due.
//! - **Automatic retries**: failed tasks are retried after a configurable
//!   backoff until their attempts are exhausted.
//! - **Graceful shutdown**: stopping drains ready work and waits for
//!   in-flight tasks to record their outcomes.
//!
//! # Example
//!
//! ```rust,no_run
//! use jiff::SignedDuration;
//! use serde::{Deserialize, Serialize};
//! use sqlx::SqlitePool;
//! use quern::{Client, Job, JobQueue, QueueConfig, Retention};
//!
//! // This is the input we'll provide when we enqueue the task.
//! #[derive(Deserialize, Serialize)]
//! struct WelcomeEmail {
//!     user_id: i64,
//!     email: String,
//! }
//!
//! impl Job for WelcomeEmail {
//!     fn config() -> QueueConfig {
//!         QueueConfig::new("welcome-email")
//!             .max_attempts(5)
//!             .backoff(SignedDuration::from_secs(30))
//!             .retention(Retention::default())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Set up the database connection pool.
//!     let pool = SqlitePool::connect("sqlite://queue.db").await?;
//!
//!     // Run migrations.
//!     quern::run_migrations(&pool).await?;
//!
//!     // Build the client and register the queue with its processor.
//!     let client = Client::builder().pool(pool).num_workers(4).build()?;
//!
//!     client.register(JobQueue::new(
//!         |_cx, WelcomeEmail { user_id, email }| async move {
//!             // Simulate sending an email.
//!             println!("Sending welcome email to {email} (user_id: {user_id})");
//!             Ok(())
//!         },
//!     ))?;
//!
//!     // Start processing enqueued tasks.
//!     client.start();
//!
//!     // Here we enqueue a new task to be processed in the background.
//!     client
//!         .enqueue(&WelcomeEmail {
//!             user_id: 42,
//!             email: "ferris@example.com".to_string(),
//!         })
//!         .await?;
//!
//!     // Give in-flight work a chance to finish before exiting.
//!     client.stop(SignedDuration::from_secs(30)).await;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Concepts
//!
//! Quern is built around a small set of concepts, each owning one concern:
//!
//! - [Tasks](#tasks) are persisted units of deferred work.
//! - [Queues](#queues) pair a configuration with a typed processor.
//! - [Clients](#clients) wire queues, storage, and the dispatcher together.
//! - [The dispatcher](#the-dispatcher) moves due tasks through workers.
//!
//! ## Tasks
//!
//! A task is a row: an opaque payload plus the bookkeeping needed to claim,
//! retry, and complete it. Pending tasks live in one table and retained
//! completed tasks in another, and a task id is only ever in one of the two.
//!
//! See [`task`] for the row types.
//!
//! ## Queues
//!
//! Queues carry the per-task-type policy: attempts, backoff, timeout, and
//! retention. The [`Queue`] trait is the small capability the dispatcher
//! needs; [`JobQueue`] implements it over any [`Job`] payload and a
//! processor closure.
//!
//! See [`queue`] for more details about queues.
//!
//! ## Clients
//!
//! The [`Client`] owns the pool, the queue registry, and the dispatcher. It
//! is a cheap-to-clone handle, and processors receive one so they can
//! enqueue follow-up work.
//!
//! See [`client`] for more details about clients.
//!
//! ## The dispatcher
//!
//! The dispatcher is internal: a fetcher that claims due tasks and arms a
//! timer for the next upcoming one, a coalescer that folds enqueue signals
//! into single fetches, a bounded worker pool, and an optional cleaner for
//! expired completion records. Starting and stopping it happens through the
//! client.
#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]
#![forbid(unsafe_code)]

use sqlx::{migrate::Migrator, SqlitePool};

pub use crate::{
    client::{Client, ClientBuilder, Context, Error},
    queue::{Job, JobQueue, ProcessError, Queue, QueueConfig, RetainData, Retention},
    task::{CompletedTask, Task, TaskId},
    timestamp::Timestamp,
};

pub mod client;
mod dispatcher;
pub mod queue;
pub mod task;
mod timestamp;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Runs Quern migrations.
///
/// These migrations must be applied before the client can enqueue or process
/// tasks.
///
/// # Example
///
/// ```rust,no_run
/// # use tokio::runtime::Runtime;
/// use sqlx::SqlitePool;
///
/// # fn main() {
/// # let rt = Runtime::new().unwrap();
/// # rt.block_on(async {
/// let pool = SqlitePool::connect("sqlite://queue.db").await?;
///
/// quern::run_migrations(&pool).await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// # }
/// ```
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
