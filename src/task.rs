//! Tasks are the persisted unit of deferred work.
//!
//! A pending task lives in the `tasks` table from the moment it is enqueued
//! until its terminal outcome. On success, or once its attempts are
//! exhausted, the row is deleted and, subject to the queue's retention
//! policy, a [`CompletedTask`] row is written in the same transaction, so a
//! given id is always in exactly one of the two tables.
//!
//! Ownership of a pending task is asserted by setting `claimed_at`. A claim
//! is only honored for a window configured on the client; a row whose
//! `claimed_at` is older than that window is considered abandoned and
//! becomes eligible for the scheduled fetch again. This is what makes
//! delivery at-least-once rather than at-most-once.

use std::{
    fmt::{self, Display},
    ops::Deref,
};

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor};
use ulid::Ulid;

use crate::timestamp::Timestamp;

/// A unique task identifier.
///
/// Task IDs are [ULID][ULID]s stored in their canonical string form.
///
/// [ULID]: https://github.com/ulid/spec?tab=readme-ov-file#specification
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, PartialOrd, Ord, sqlx::Type)]
#[sqlx(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl Deref for TaskId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A pending task row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    /// Unique identifier of the task.
    pub id: TaskId,

    /// Name of the queue the task belongs to.
    pub queue: String,

    /// Opaque serialized payload handed back to the queue on execution.
    pub task: Vec<u8>,

    /// When the task was enqueued.
    pub created_at: Timestamp,

    /// Earliest instant the task may be executed, if delayed.
    pub wait_until: Option<Timestamp>,

    /// When the task was last claimed by a dispatcher, if ever.
    pub claimed_at: Option<Timestamp>,

    /// When the most recent attempt started, if any.
    pub last_executed_at: Option<Timestamp>,

    /// Number of attempts recorded so far.
    pub attempts: i64,
}

const SELECT_COLUMNS: &str =
    "id, queue, task, created_at, wait_until, claimed_at, last_executed_at, attempts";

/// Returns up to `limit` tasks that are not owned by a live claim, ordered by
/// their effective scheduled time.
///
/// `cutoff` encodes the reclaim window: a row claimed before the cutoff is
/// considered abandoned and is returned alongside unclaimed rows. Rows whose
/// `wait_until` is still in the future are deliberately included so the
/// caller can schedule its next wake-up from the head of the backlog.
pub(crate) async fn get_scheduled_tasks<'a, E>(
    executor: E,
    cutoff: Timestamp,
    limit: i64,
) -> sqlx::Result<Vec<Task>>
where
    E: SqliteExecutor<'a>,
{
    sqlx::query_as::<_, Task>(&format!(
        r#"
        select {SELECT_COLUMNS}
        from tasks
        where claimed_at is null or claimed_at < ?1
        order by coalesce(wait_until, created_at) asc, id asc
        limit ?2
        "#
    ))
    .bind(cutoff)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Atomically claims the given set of tasks in a single statement.
pub(crate) async fn claim<'a, E>(executor: E, ids: &[TaskId], now: Timestamp) -> sqlx::Result<()>
where
    E: SqliteExecutor<'a>,
{
    if ids.is_empty() {
        return Ok(());
    }

    let mut query = QueryBuilder::<Sqlite>::new("update tasks set claimed_at = ");
    query.push_bind(now);
    query.push(" where id in (");

    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");

    query.build().execute(executor).await?;

    Ok(())
}

/// Runs an arbitrary select over the `tasks` table.
///
/// This exists for read-only inspection surfaces and is not used on the
/// dispatch hot path. The query must project the full set of task columns.
pub async fn get_tasks<'a, E>(executor: E, query: &str) -> sqlx::Result<Vec<Task>>
where
    E: SqliteExecutor<'a>,
{
    sqlx::query_as::<_, Task>(query).fetch_all(executor).await
}

/// Inserts a new pending row.
pub(crate) async fn insert_pending<'a, E>(executor: E, task: &Task) -> sqlx::Result<()>
where
    E: SqliteExecutor<'a>,
{
    sqlx::query(
        r#"
        insert into tasks (id, queue, task, created_at, wait_until, claimed_at, last_executed_at, attempts)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(task.id.clone())
    .bind(&task.queue)
    .bind(&task.task)
    .bind(task.created_at)
    .bind(task.wait_until)
    .bind(task.claimed_at)
    .bind(task.last_executed_at)
    .bind(task.attempts)
    .execute(executor)
    .await?;

    Ok(())
}

impl Task {
    /// Deletes this pending row inside the caller's transaction.
    pub(crate) async fn delete(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        sqlx::query("delete from tasks where id = ?1")
            .bind(self.id.clone())
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Records a retriable failure: the claim is released, the next attempt
    /// is deferred until `wait_until`, and the attempt count observed in
    /// memory is persisted.
    pub(crate) async fn fail<'a, E>(
        &self,
        executor: E,
        wait_until: Timestamp,
        last_executed_at: Timestamp,
    ) -> sqlx::Result<()>
    where
        E: SqliteExecutor<'a>,
    {
        sqlx::query(
            r#"
            update tasks
            set claimed_at = null,
                wait_until = ?2,
                last_executed_at = ?3,
                attempts = ?4
            where id = ?1
            "#,
        )
        .bind(self.id.clone())
        .bind(wait_until)
        .bind(last_executed_at)
        .bind(self.attempts)
        .execute(executor)
        .await?;

        Ok(())
    }
}

/// A completed task row.
///
/// Whether this row exists at all, and whether it carries the payload, is
/// governed by the queue's retention policy.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CompletedTask {
    /// Unique identifier of the task.
    pub id: TaskId,

    /// Name of the queue the task belonged to.
    pub queue: String,

    /// When the task was enqueued.
    pub created_at: Timestamp,

    /// When the final attempt started.
    pub last_executed_at: Timestamp,

    /// Number of attempts made.
    pub attempts: i64,

    /// Duration of the final attempt, in microseconds.
    pub last_duration_micro: i64,

    /// Whether the final attempt succeeded.
    pub succeeded: bool,

    /// The payload, if the retention policy keeps it.
    pub task: Option<Vec<u8>>,

    /// When this row becomes eligible for cleanup, if it expires.
    pub expires_at: Option<Timestamp>,

    /// The final error message, for failed tasks.
    pub error: Option<String>,
}

impl CompletedTask {
    /// Inserts this completion row inside the caller's transaction.
    pub(crate) async fn insert(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            insert into tasks_completed
              (id, queue, created_at, last_executed_at, attempts, last_duration_micro, succeeded, task, expires_at, error)
            values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(self.id.clone())
        .bind(&self.queue)
        .bind(self.created_at)
        .bind(self.last_executed_at)
        .bind(self.attempts)
        .bind(self.last_duration_micro)
        .bind(self.succeeded)
        .bind(&self.task)
        .bind(self.expires_at)
        .bind(&self.error)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Deletes completion rows whose expiry has passed, returning how many
    /// were removed.
    pub(crate) async fn delete_expired<'a, E>(executor: E, now: Timestamp) -> sqlx::Result<u64>
    where
        E: SqliteExecutor<'a>,
    {
        let result =
            sqlx::query("delete from tasks_completed where expires_at is not null and expires_at <= ?1")
                .bind(now)
                .execute(executor)
                .await?;

        Ok(result.rows_affected())
    }
}
