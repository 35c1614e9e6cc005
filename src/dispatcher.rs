//! The dispatcher claims due tasks and executes them with bounded
//! concurrency.
//!
//! Internally it is a small set of cooperating loops connected by channels:
//!
//! - **Workers** wait on the tasks channel and run one task at a time to its
//!   recorded outcome. An idle-capacity semaphore holds one permit per
//!   worker; a permit travels with each dispatched task and returns to the
//!   pool once the worker has committed the outcome.
//! - The **coalescer** folds any burst of ready signals into a single
//!   trigger, so N enqueues between two fetches cost exactly one extra
//!   database query.
//! - The **fetcher** is the only hot-path reader of the tasks table. It
//!   claims up to one task per idle worker plus one look-ahead row, hands the
//!   ready ones to the workers, and uses the look-ahead row to decide when to
//!   wake next instead of polling.
//! - The optional **cleaner** periodically deletes expired completion rows.
//!
//! Two signals end a run. Cancelling the token returned by start tears every
//! loop down at its next suspension point. A graceful stop instead lets the
//! fetcher drain: it keeps dispatching ready tasks, ignoring new signals,
//! until none remain and every worker has reported its outcome.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration as StdDuration,
};

use jiff::SignedDuration;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinError,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    client::{Client, Context},
    queue::{ProcessError, QueueConfig},
    task::{self, CompletedTask, Task},
    timestamp::Timestamp,
};

// Enqueues must never block on the dispatcher, so ready is deep; trigger is
// coalesced and should never hold more than one item in practice.
const READY_CAPACITY: usize = 1024;
const TRIGGER_CAPACITY: usize = 10;

const FETCH_RETRY_PAUSE: StdDuration = StdDuration::from_millis(100);
const IDLE_POLL_PAUSE: StdDuration = StdDuration::from_millis(100);
const DRAIN_POLL_PAUSE: StdDuration = StdDuration::from_millis(50);
const STOP_POLL_PAUSE: StdDuration = StdDuration::from_millis(10);

type TaskHandoff = (Task, OwnedSemaphorePermit);
type SharedTaskReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<TaskHandoff>>>;

pub(crate) struct Dispatcher {
    num_workers: usize,
    release_after: SignedDuration,
    cleanup_interval: Option<SignedDuration>,
    state: Mutex<Option<RunState>>,
}

/// Channels and tokens of a running dispatcher; present only while running.
struct RunState {
    ready_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    worker_permits: Arc<Semaphore>,
    fetcher_done: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        num_workers: usize,
        release_after: SignedDuration,
        cleanup_interval: Option<SignedDuration>,
    ) -> Self {
        Self {
            num_workers,
            release_after,
            cleanup_interval,
            state: Mutex::new(None),
        }
    }

    /// Starts the dispatch loops, returning the hard-cancel token.
    ///
    /// Idempotent: starting a running dispatcher returns the token of the
    /// existing run.
    pub(crate) fn start(&self, client: &Client, cancel: CancellationToken) -> CancellationToken {
        let mut state = self.state.lock().unwrap();
        if let Some(running) = state.as_ref() {
            return running.cancel.clone();
        }

        let shutdown = CancellationToken::new();
        let fetcher_done = CancellationToken::new();
        let worker_permits = Arc::new(Semaphore::new(self.num_workers));

        let (tasks_tx, tasks_rx) = mpsc::channel::<TaskHandoff>(self.num_workers);
        let tasks_rx: SharedTaskReceiver = Arc::new(tokio::sync::Mutex::new(tasks_rx));
        let (ready_tx, ready_rx) = mpsc::channel(READY_CAPACITY);
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let triggered = Arc::new(AtomicBool::new(false));

        for _ in 0..self.num_workers {
            tokio::spawn(run_worker(
                client.clone(),
                tasks_rx.clone(),
                ready_tx.clone(),
                cancel.clone(),
            ));
        }

        tokio::spawn(run_coalescer(
            ready_rx,
            trigger_tx,
            triggered.clone(),
            shutdown.clone(),
            cancel.clone(),
        ));

        let fetcher = Fetcher {
            client: client.clone(),
            tasks_tx,
            ready_tx: ready_tx.clone(),
            trigger_rx,
            worker_permits: worker_permits.clone(),
            triggered,
            shutdown: shutdown.clone(),
            cancel: cancel.clone(),
            release_after: self.release_after,
            num_workers: self.num_workers,
        };
        tokio::spawn(fetcher.run(fetcher_done.clone()));

        if let Some(interval) = self.cleanup_interval {
            tokio::spawn(run_cleaner(
                client.clone(),
                interval,
                shutdown.clone(),
                cancel.clone(),
            ));
        }

        // Once the fetcher exits, whether from a hard cancel or a finished
        // drain, this run is over: clear the state so notify goes quiet and
        // a fresh start becomes possible.
        tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            let fetcher_done = fetcher_done.clone();
            let worker_permits = worker_permits.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = fetcher_done.cancelled() => {}
                }
                client.dispatcher().clear_run(&worker_permits);
            }
        });

        // Seed one fetch so work enqueued before this run is picked up.
        let _ = ready_tx.try_send(());

        *state = Some(RunState {
            ready_tx,
            shutdown,
            cancel: cancel.clone(),
            worker_permits,
            fetcher_done,
        });

        cancel
    }

    /// Clears the run state if `worker_permits` identifies the current run.
    ///
    /// The identity check keeps a stale clear from wiping out a run started
    /// afterwards.
    pub(crate) fn clear_run(&self, worker_permits: &Arc<Semaphore>) {
        let mut state = self.state.lock().unwrap();
        if state
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(&running.worker_permits, worker_permits))
        {
            *state = None;
        }
    }

    /// Signals that new work may be available. Effective only while running.
    pub(crate) fn notify(&self) {
        let state = self.state.lock().unwrap();
        if let Some(running) = state.as_ref() {
            let _ = running.ready_tx.try_send(());
        }
    }

    /// Gracefully stops the dispatcher, waiting up to `timeout` for the
    /// drain to finish. Returns whether it did; when it did not, the run is
    /// hard-cancelled and claimed rows are left to claim expiry.
    pub(crate) async fn stop(&self, timeout: SignedDuration) -> bool {
        let Some((shutdown, cancel, worker_permits, fetcher_done)) = ({
            let state = self.state.lock().unwrap();
            state.as_ref().map(|running| {
                (
                    running.shutdown.clone(),
                    running.cancel.clone(),
                    running.worker_permits.clone(),
                    running.fetcher_done.clone(),
                )
            })
        }) else {
            return true;
        };

        shutdown.cancel();

        let deadline = Instant::now() + StdDuration::try_from(timeout).unwrap_or_default();
        let drained = loop {
            if fetcher_done.is_cancelled()
                && worker_permits.available_permits() == self.num_workers
            {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(STOP_POLL_PAUSE).await;
        };

        if !drained {
            // The grace period lapsed; tear the remaining loops down. Their
            // in-flight outcomes may be lost, which at-least-once absorbs.
            cancel.cancel();
        }

        self.clear_run(&worker_permits);

        drained
    }
}

/// Executes tasks from the shared tasks channel until it closes or the run
/// is hard-cancelled.
async fn run_worker(
    client: Client,
    tasks: SharedTaskReceiver,
    ready_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        let handoff = tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            handoff = async { tasks.lock().await.recv().await } => handoff,
        };

        let Some((task, permit)) = handoff else { return };
        process_task(&client, &ready_tx, task).await;
        drop(permit);
    }
}

/// Folds ready signals into at most one pending trigger.
///
/// The `triggered` flag is reset by the fetcher at the start of each fetch,
/// so an enqueue landing mid-fetch still produces exactly one follow-up
/// fetch, while a burst of enqueues produces no more than that.
async fn run_coalescer(
    mut ready_rx: mpsc::Receiver<()>,
    trigger_tx: mpsc::Sender<()>,
    triggered: Arc<AtomicBool>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            _ = shutdown.cancelled() => return,
            ready = ready_rx.recv() => {
                if ready.is_none() {
                    return;
                }
                if triggered
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                    && trigger_tx.send(()).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Periodically deletes expired completion rows.
async fn run_cleaner(
    client: Client,
    period: SignedDuration,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) {
    let Ok(period) = StdDuration::try_from(period) else {
        return;
    };

    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                if let Err(error) =
                    CompletedTask::delete_expired(client.pool(), Timestamp::now()).await
                {
                    tracing::error!(%error, "failed to delete expired completed tasks");
                }
            }
        }
    }
}

struct Fetcher {
    client: Client,
    tasks_tx: mpsc::Sender<TaskHandoff>,
    ready_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
    worker_permits: Arc<Semaphore>,
    triggered: Arc<AtomicBool>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    release_after: SignedDuration,
    num_workers: usize,
}

impl Fetcher {
    async fn run(mut self, done: CancellationToken) {
        // Closing the tasks channel on exit is what lets idle workers leave;
        // the guard reports the exit to stop.
        let _done = done.drop_guard();
        let mut wake_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return,
                _ = self.shutdown.cancelled() => {
                    self.drain().await;
                    return;
                }
                trigger = self.trigger_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                    wake_at = self.fetch().await;
                }
                _ = sleep_until_or_forever(wake_at) => wake_at = self.fetch().await,
            }
        }
    }

    /// Claims and dispatches due tasks, returning when to wake next.
    ///
    /// `None` disarms the timer entirely: either there is no known upcoming
    /// work and the coalescer will wake us, or an immediate re-fetch has
    /// already been signalled.
    async fn fetch(&self) -> Option<Instant> {
        // Ready signals from this point on must schedule another fetch, or
        // an enqueue racing with this fetch could go unnoticed.
        self.triggered.store(false, Ordering::SeqCst);

        // Fetch one task per available worker, plus the next upcoming task
        // so we know when to query again without continually polling.
        let workers = self.acquire_workers().await;

        let cutoff = Timestamp::now().saturating_sub(self.release_after);
        let mut tasks =
            match task::get_scheduled_tasks(self.client.pool(), cutoff, workers as i64 + 1).await
            {
                Ok(tasks) => tasks,
                Err(error) => {
                    tracing::error!(%error, "fetch tasks query failed");
                    return self.retry_later().await;
                }
            };

        let now = Timestamp::now();
        let mut boundary = tasks.len();
        for (i, candidate) in tasks.iter().enumerate() {
            // The workers are full, or this task is not ready yet; either
            // way it is the one to schedule around.
            if i >= workers || !is_ready(candidate, now) {
                boundary = i;
                break;
            }
        }

        let next = tasks.split_off(boundary).into_iter().next();

        let ids: Vec<_> = tasks.iter().map(|task| task.id.clone()).collect();
        if let Err(error) = task::claim(self.client.pool(), &ids, now).await {
            tracing::error!(%error, "failed to claim tasks");
            return self.retry_later().await;
        }

        tracing::debug!(ready = tasks.len(), next = next.is_some(), "fetched tasks");

        if !self.dispatch(tasks).await {
            return None;
        }

        self.schedule(next)
    }

    /// Hands each claimed task to a worker, blocking on idle capacity.
    ///
    /// Returns false if the workers are gone.
    async fn dispatch(&self, tasks: Vec<Task>) -> bool {
        for mut task in tasks {
            task.attempts += 1;

            let Ok(permit) = self.worker_permits.clone().acquire_owned().await else {
                return false;
            };
            if self.tasks_tx.send((task, permit)).await.is_err() {
                return false;
            }
        }

        true
    }

    /// Arms the timer for the next upcoming task.
    fn schedule(&self, next: Option<Task>) -> Option<Instant> {
        let next = next?;

        let Some(wait_until) = next.wait_until else {
            // We are behind; fetch again immediately.
            self.signal_ready();
            return None;
        };

        let until = wait_until.duration_since(Timestamp::now());
        match StdDuration::try_from(until) {
            Ok(delay) if !delay.is_zero() => Some(Instant::now() + delay),
            _ => {
                self.signal_ready();
                None
            }
        }
    }

    /// Backs off briefly after a failed fetch and signals another attempt.
    async fn retry_later(&self) -> Option<Instant> {
        tokio::time::sleep(FETCH_RETRY_PAUSE).await;
        self.signal_ready();
        None
    }

    fn signal_ready(&self) {
        let _ = self.ready_tx.try_send(());
    }

    /// Waits until at least one worker is idle, returning how many are.
    async fn acquire_workers(&self) -> usize {
        loop {
            let available = self.worker_permits.available_permits();
            if available > 0 {
                return available;
            }
            tokio::time::sleep(IDLE_POLL_PAUSE).await;
        }
    }

    /// Keeps dispatching ready tasks until none remain and every worker has
    /// returned its permit, then lets the tasks channel close.
    ///
    /// New ready signals and triggers are ignored; tasks deferred into the
    /// future, including retries backed off during the drain, are left for a
    /// later run.
    async fn drain(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let available = self.worker_permits.available_permits();
            if available == 0 {
                tokio::time::sleep(DRAIN_POLL_PAUSE).await;
                continue;
            }

            let cutoff = Timestamp::now().saturating_sub(self.release_after);
            let tasks = match task::get_scheduled_tasks(
                self.client.pool(),
                cutoff,
                available as i64 + 1,
            )
            .await
            {
                Ok(tasks) => tasks,
                Err(error) => {
                    tracing::error!(%error, "drain fetch query failed");
                    tokio::time::sleep(FETCH_RETRY_PAUSE).await;
                    continue;
                }
            };

            let now = Timestamp::now();
            let ready: Vec<_> = tasks
                .into_iter()
                .filter(|task| is_ready(task, now))
                .take(available)
                .collect();

            if ready.is_empty() {
                if self.worker_permits.available_permits() == self.num_workers {
                    return;
                }
                // In-flight tasks may still produce work; check back.
                tokio::time::sleep(DRAIN_POLL_PAUSE).await;
                continue;
            }

            let ids: Vec<_> = ready.iter().map(|task| task.id.clone()).collect();
            if let Err(error) = task::claim(self.client.pool(), &ids, now).await {
                tracing::error!(%error, "failed to claim tasks");
                tokio::time::sleep(FETCH_RETRY_PAUSE).await;
                continue;
            }

            if !self.dispatch(ready).await {
                return;
            }
        }
    }
}

fn is_ready(task: &Task, now: Timestamp) -> bool {
    task.wait_until.map_or(true, |wait_until| wait_until <= now)
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs one task to its recorded outcome.
///
/// The processor is executed on its own spawned task with no tie to the
/// dispatcher's lifetime, so a graceful stop never cancels in-flight work
/// and a panic is contained at the join boundary.
#[instrument(
    skip_all,
    fields(task.id = %task.id, task.queue = %task.queue, task.attempt = task.attempts)
)]
async fn process_task(client: &Client, ready_tx: &mpsc::Sender<()>, task: Task) {
    let Some(queue) = client.queue(&task.queue) else {
        // Leave the claim in place; the task surfaces again once the claim
        // lapses, by which point the queue may have been registered.
        tracing::error!("no queue registered for task");
        return;
    };

    let config = queue.config().clone();
    let started = Timestamp::now();
    let clock = Instant::now();

    let cx = Context::new(client.clone(), task.id.clone(), task.attempts);
    let payload = task.task.clone();
    let mut processor = tokio::spawn(async move { queue.receive(cx, payload).await });

    let result = match config.timeout.map(StdDuration::try_from) {
        Some(Ok(limit)) => match tokio::time::timeout(limit, &mut processor).await {
            Ok(outcome) => flatten(outcome),
            Err(_) => {
                processor.abort();
                Err(format!(
                    "task processing timed out after {:#}",
                    config.timeout.unwrap_or_default()
                ))
            }
        },
        _ => flatten(processor.await),
    };

    let duration = clock.elapsed();

    match result {
        Ok(()) => task_success(client, &config, &task, started, duration).await,
        Err(error) => {
            task_failure(client, ready_tx, &config, &task, started, duration, error).await
        }
    }
}

/// Collapses the processor's join result into a plain outcome, converting a
/// panic into an error carrying the panic message.
fn flatten(outcome: Result<Result<(), ProcessError>, JoinError>) -> Result<(), String> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(error.to_string()),
        Err(join_error) if join_error.is_panic() => {
            let panic = join_error.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task processor panicked".to_string());
            Err(message)
        }
        Err(_) => Err("task processing was cancelled".to_string()),
    }
}

async fn task_success(
    client: &Client,
    config: &QueueConfig,
    task: &Task,
    started: Timestamp,
    duration: StdDuration,
) {
    tracing::info!(?duration, "task processed");

    if let Err(error) = record_outcome(client, config, task, started, duration, None).await {
        // The row stays claimed and will be retried once the claim lapses.
        tracing::error!(%error, "failed to record task success");
    }
}

async fn task_failure(
    client: &Client,
    ready_tx: &mpsc::Sender<()>,
    config: &QueueConfig,
    task: &Task,
    started: Timestamp,
    duration: StdDuration,
    error: String,
) {
    let remaining = config.max_attempts - task.attempts;

    tracing::error!(?duration, remaining, %error, "task processing failed");

    if remaining < 1 {
        if let Err(error) =
            record_outcome(client, config, task, started, duration, Some(error.as_str())).await
        {
            tracing::error!(%error, "failed to record task failure");
        }
        return;
    }

    let wait_until = Timestamp::now().saturating_add(config.backoff);
    if let Err(error) = task.fail(client.pool(), wait_until, started).await {
        tracing::error!(%error, "failed to record task failure");
    }

    let _ = ready_tx.try_send(());
}

/// Removes the pending row and, subject to the retention policy, writes the
/// completion row in the same transaction.
async fn record_outcome(
    client: &Client,
    config: &QueueConfig,
    task: &Task,
    started: Timestamp,
    duration: StdDuration,
    error: Option<&str>,
) -> sqlx::Result<()> {
    let mut tx = client.pool().begin().await?;

    task.delete(&mut *tx).await?;

    if let Some(completed) = completion_row(config, task, started, duration, error) {
        completed.insert(&mut *tx).await?;
    }

    tx.commit().await?;

    Ok(())
}

fn completion_row(
    config: &QueueConfig,
    task: &Task,
    started: Timestamp,
    duration: StdDuration,
    error: Option<&str>,
) -> Option<CompletedTask> {
    let retention = config.retention.as_ref()?;
    let succeeded = error.is_none();

    if succeeded && retention.only_failed {
        return None;
    }

    let payload = retention
        .data
        .as_ref()
        .and_then(|data| (!data.only_failed || !succeeded).then(|| task.task.clone()));

    let expires_at = retention
        .duration
        .map(|duration| Timestamp::now().saturating_add(duration));

    Some(CompletedTask {
        id: task.id.clone(),
        queue: task.queue.clone(),
        created_at: task.created_at,
        last_executed_at: started,
        attempts: task.attempts,
        last_duration_micro: i64::try_from(duration.as_micros()).unwrap_or(i64::MAX),
        succeeded,
        task: payload,
        expires_at,
        error: error.map(ToString::to_string),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde::{Deserialize, Serialize};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use sqlx::SqlitePool;

    use super::*;
    use crate::{
        client::Client,
        queue::{Job, JobQueue, QueueConfig, RetainData, Retention},
        task::testing::{fetch_completed, fetch_pending, pending},
    };

    /// The dispatcher mixes writers across several tokio tasks; a single
    /// connection keeps SQLite from ever reporting a busy database.
    async fn single_connection_pool(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) -> SqlitePool {
        pool_opts
            .max_connections(1)
            .connect_with(connect_opts)
            .await
            .expect("pool should connect")
    }

    fn client_with(pool: &SqlitePool, num_workers: usize) -> Client {
        Client::builder()
            .pool(pool.clone())
            .num_workers(num_workers)
            .release_after(SignedDuration::from_secs(300))
            .build()
            .expect("client config should be valid")
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                if condition().await {
                    return;
                }
                tokio::time::sleep(StdDuration::from_millis(25)).await;
            }
        })
        .await
        .expect("condition should be met in time");
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Sleepy;

    impl Job for Sleepy {
        fn config() -> QueueConfig {
            QueueConfig::new("sleepy").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn success_moves_the_task_to_completed(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Sleepy| async move {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
                Ok(())
            }))
            .unwrap();

        client.start();
        client.enqueue(&Sleepy).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_completed(pool_ref).await.unwrap().len() == 1 }).await;

        assert!(fetch_pending(&pool).await.unwrap().is_empty());

        let completed = fetch_completed(&pool).await.unwrap().remove(0);
        assert!(completed.succeeded);
        assert_eq!(completed.attempts, 1);
        assert!(completed.last_duration_micro >= 10_000);
        assert!(completed.task.is_none());
        assert!(completed.expires_at.is_none());
        assert!(completed.error.is_none());

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Doomed;

    impl Job for Doomed {
        fn config() -> QueueConfig {
            QueueConfig::new("doomed")
                .max_attempts(3)
                .backoff(SignedDuration::from_millis(50))
                .retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn failures_retry_with_backoff_then_complete(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        let attempts: Arc<StdMutex<Vec<Instant>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let attempts = attempts.clone();
            client
                .register(JobQueue::new(move |_cx, Doomed| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.lock().unwrap().push(Instant::now());
                        Err("boom".into())
                    }
                }))
                .unwrap();
        }

        client.start();
        client.enqueue(&Doomed).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { !fetch_completed(pool_ref).await.unwrap().is_empty() }).await;

        let completed = fetch_completed(&pool).await.unwrap().remove(0);
        assert!(!completed.succeeded);
        assert_eq!(completed.attempts, 3);
        assert_eq!(completed.error.as_deref(), Some("boom"));
        assert!(fetch_pending(&pool).await.unwrap().is_empty());

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);
        for window in attempts.windows(2) {
            // Scheduling happens off database timestamps, so allow a little
            // slack under the nominal 50ms backoff.
            assert!(window[1] - window[0] >= StdDuration::from_millis(40));
        }

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Delayed;

    impl Job for Delayed {
        fn config() -> QueueConfig {
            QueueConfig::new("delayed").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn scheduled_tasks_wait_for_their_moment(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        let executed_at: Arc<StdMutex<Option<Instant>>> = Arc::new(StdMutex::new(None));
        {
            let executed_at = executed_at.clone();
            client
                .register(JobQueue::new(move |_cx, Delayed| {
                    let executed_at = executed_at.clone();
                    async move {
                        executed_at.lock().unwrap().replace(Instant::now());
                        Ok(())
                    }
                }))
                .unwrap();
        }

        client.start();

        let enqueued_at = Instant::now();
        client
            .enqueue_at(
                &Delayed,
                Timestamp::now().saturating_add(SignedDuration::from_millis(200)),
            )
            .await
            .unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { !fetch_completed(pool_ref).await.unwrap().is_empty() }).await;

        let executed_at = executed_at.lock().unwrap().expect("task should have run");
        let delay = executed_at - enqueued_at;
        assert!(delay >= StdDuration::from_millis(190), "ran after {delay:?}");
        assert!(delay <= StdDuration::from_millis(600), "ran after {delay:?}");

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Serial {
        name: String,
    }

    impl Job for Serial {
        fn config() -> QueueConfig {
            QueueConfig::new("serial").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn single_worker_runs_tasks_one_at_a_time(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 1);

        let starts: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());
        {
            let starts = starts.clone();
            let gate = gate.clone();
            client
                .register(JobQueue::new(move |_cx, Serial { name }| {
                    let starts = starts.clone();
                    let gate = gate.clone();
                    async move {
                        starts.lock().unwrap().push(name.clone());
                        if name == "a" {
                            gate.notified().await;
                        }
                        Ok(())
                    }
                }))
                .unwrap();
        }

        client.start();
        client
            .enqueue(&Serial {
                name: "a".to_string(),
            })
            .await
            .unwrap();
        // Distinct creation instants keep the dispatch order deterministic.
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        client
            .enqueue(&Serial {
                name: "b".to_string(),
            })
            .await
            .unwrap();

        let starts_ref = &starts;
        wait_for(|| async move { !starts_ref.lock().unwrap().is_empty() }).await;
        tokio::time::sleep(StdDuration::from_millis(150)).await;

        // The second task must not start while the first blocks the only
        // worker.
        assert_eq!(*starts.lock().unwrap(), ["a"]);

        gate.notify_one();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_completed(pool_ref).await.unwrap().len() == 2 }).await;

        assert_eq!(*starts.lock().unwrap(), ["a", "b"]);
        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Quick;

    impl Job for Quick {
        fn config() -> QueueConfig {
            QueueConfig::new("quick").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn graceful_stop_drains_enqueued_work(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 4);

        client
            .register(JobQueue::new(|_cx, Quick| async move {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
                Ok(())
            }))
            .unwrap();

        client.start();
        for _ in 0..100 {
            client.enqueue(&Quick).await.unwrap();
        }

        assert!(client.stop(SignedDuration::from_secs(30)).await);

        assert_eq!(fetch_completed(&pool).await.unwrap().len(), 100);
        assert!(fetch_pending(&pool).await.unwrap().is_empty());

        let completed = fetch_completed(&pool).await.unwrap();
        assert!(completed.iter().all(|row| row.succeeded));
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Reclaimed;

    impl Job for Reclaimed {
        fn config() -> QueueConfig {
            QueueConfig::new("reclaimed").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn abandoned_claims_are_reclaimed(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;

        let client = Client::builder()
            .pool(pool.clone())
            .num_workers(2)
            .release_after(SignedDuration::from_secs(1))
            .build()
            .unwrap();

        client
            .register(JobQueue::new(|_cx, Reclaimed| async move { Ok(()) }))
            .unwrap();

        // A claim from a run that never reported an outcome, now well past
        // the release window.
        let mut task = pending("stuck", "reclaimed", Timestamp::now());
        task.task = serde_json::to_vec(&Reclaimed).unwrap();
        task.claimed_at = Some(Timestamp::now().saturating_sub(SignedDuration::from_secs(2)));
        crate::task::insert_pending(&pool, &task).await.unwrap();

        client.start();

        let pool_ref = &pool;
        wait_for(|| async move { !fetch_completed(pool_ref).await.unwrap().is_empty() }).await;

        let completed = fetch_completed(&pool).await.unwrap().remove(0);
        assert_eq!(completed.id.to_string(), "stuck");
        assert!(completed.succeeded);
        assert_eq!(completed.attempts, 1);

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Panicky;

    impl Job for Panicky {
        fn config() -> QueueConfig {
            QueueConfig::new("panicky").retention(Retention::default())
        }
    }

    #[sqlx::test]
    #[allow(unreachable_code)]
    async fn panics_become_task_failures(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Panicky| async move {
                panic!("kaboom");
                Ok(())
            }))
            .unwrap();

        client.start();
        client.enqueue(&Panicky).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { !fetch_completed(pool_ref).await.unwrap().is_empty() }).await;

        let completed = fetch_completed(&pool).await.unwrap().remove(0);
        assert!(!completed.succeeded);
        assert!(completed.error.as_deref().unwrap().contains("kaboom"));

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Slowpoke;

    impl Job for Slowpoke {
        fn config() -> QueueConfig {
            QueueConfig::new("slowpoke")
                .timeout(SignedDuration::from_millis(50))
                .retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn timeouts_bound_processor_execution(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Slowpoke| async move {
                tokio::time::sleep(StdDuration::from_secs(60)).await;
                Ok(())
            }))
            .unwrap();

        client.start();
        client.enqueue(&Slowpoke).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { !fetch_completed(pool_ref).await.unwrap().is_empty() }).await;

        let completed = fetch_completed(&pool).await.unwrap().remove(0);
        assert!(!completed.succeeded);
        assert!(completed.error.as_deref().unwrap().contains("timed out"));
        assert!(completed.last_duration_micro >= 50_000);

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Clogged;

    impl Job for Clogged {
        fn config() -> QueueConfig {
            QueueConfig::new("clogged").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn fetch_is_bounded_by_idle_workers(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        let gate = Arc::new(Semaphore::new(0));
        {
            let gate = gate.clone();
            client
                .register(JobQueue::new(move |_cx, Clogged| {
                    let gate = gate.clone();
                    async move {
                        let _permit = gate.acquire().await;
                        Ok(())
                    }
                }))
                .unwrap();
        }

        client.start();
        for _ in 0..50 {
            client.enqueue(&Clogged).await.unwrap();
        }

        // Give the fetcher time to go around its loop a few times while the
        // workers are blocked.
        tokio::time::sleep(StdDuration::from_millis(400)).await;

        let claimed = fetch_pending(&pool)
            .await
            .unwrap()
            .iter()
            .filter(|task| task.claimed_at.is_some())
            .count();
        assert!(claimed <= 3, "claimed {claimed} tasks with 2 workers");

        gate.add_permits(10_000);

        assert!(client.stop(SignedDuration::from_secs(30)).await);
        assert_eq!(fetch_completed(&pool).await.unwrap().len(), 50);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Traceless;

    impl Job for Traceless {
        fn config() -> QueueConfig {
            QueueConfig::new("traceless")
        }
    }

    #[sqlx::test]
    async fn no_retention_leaves_no_completion_row(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Traceless| async move { Ok(()) }))
            .unwrap();

        client.start();
        client.enqueue(&Traceless).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_pending(pool_ref).await.unwrap().is_empty() }).await;

        assert!(fetch_completed(&pool).await.unwrap().is_empty());

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Fussy {
        fail: bool,
    }

    impl Job for Fussy {
        fn config() -> QueueConfig {
            QueueConfig::new("fussy").retention(Retention {
                only_failed: true,
                ..Default::default()
            })
        }
    }

    #[sqlx::test]
    async fn only_failed_retention_skips_successes(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Fussy { fail }| async move {
                if fail {
                    Err("nope".into())
                } else {
                    Ok(())
                }
            }))
            .unwrap();

        client.start();
        client.enqueue(&Fussy { fail: false }).await.unwrap();
        client.enqueue(&Fussy { fail: true }).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_pending(pool_ref).await.unwrap().is_empty() }).await;

        let completed = fetch_completed(&pool).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert!(!completed[0].succeeded);
        assert_eq!(completed[0].error.as_deref(), Some("nope"));

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Archived {
        fail: bool,
    }

    impl Job for Archived {
        fn config() -> QueueConfig {
            QueueConfig::new("archived").retention(Retention {
                duration: Some(SignedDuration::from_secs(3600)),
                data: Some(RetainData { only_failed: true }),
                ..Default::default()
            })
        }
    }

    #[sqlx::test]
    async fn payload_retention_follows_the_data_policy(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Archived { fail }| async move {
                if fail {
                    Err("nope".into())
                } else {
                    Ok(())
                }
            }))
            .unwrap();

        client.start();
        client.enqueue(&Archived { fail: false }).await.unwrap();
        client.enqueue(&Archived { fail: true }).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_completed(pool_ref).await.unwrap().len() == 2 }).await;

        let now = Timestamp::now();
        for completed in fetch_completed(&pool).await.unwrap() {
            // Payload bytes only for the failed task, per the data policy.
            if completed.succeeded {
                assert!(completed.task.is_none());
            } else {
                let payload: Archived =
                    serde_json::from_slice(&completed.task.unwrap()).unwrap();
                assert!(payload.fail);
            }
            assert!(completed.expires_at.unwrap() > now);
        }

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[sqlx::test]
    async fn cleaner_removes_expired_completions(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;

        let client = Client::builder()
            .pool(pool.clone())
            .cleanup_interval(SignedDuration::from_millis(100))
            .build()
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        CompletedTask {
            id: "stale".into(),
            queue: "old".to_string(),
            created_at: Timestamp::now(),
            last_executed_at: Timestamp::now(),
            attempts: 1,
            last_duration_micro: 10,
            succeeded: true,
            task: None,
            expires_at: Some(Timestamp::now().saturating_sub(SignedDuration::from_secs(1))),
            error: None,
        }
        .insert(&mut *conn)
        .await
        .unwrap();
        drop(conn);

        client.start();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_completed(pool_ref).await.unwrap().is_empty() }).await;

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Chained {
        stage: i64,
    }

    impl Job for Chained {
        fn config() -> QueueConfig {
            QueueConfig::new("chained").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn processors_can_enqueue_follow_up_work(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|cx, Chained { stage }| async move {
                if stage == 1 {
                    cx.client().enqueue(&Chained { stage: 2 }).await?;
                }
                Ok(())
            }))
            .unwrap();

        client.start();
        client.enqueue(&Chained { stage: 1 }).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_completed(pool_ref).await.unwrap().len() == 2 }).await;

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Routine;

    impl Job for Routine {
        fn config() -> QueueConfig {
            QueueConfig::new("routine").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn start_is_idempotent_and_stop_is_a_no_op_when_stopped(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Routine| async move { Ok(()) }))
            .unwrap();

        // Stopping before starting changes nothing.
        assert!(client.stop(SignedDuration::from_secs(1)).await);

        let first = client.start();
        let second = client.start();
        assert!(!first.is_cancelled());
        assert!(!second.is_cancelled());

        client.enqueue(&Routine).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { fetch_completed(pool_ref).await.unwrap().len() == 1 }).await;

        assert!(client.stop(SignedDuration::from_secs(10)).await);
        assert!(client.stop(SignedDuration::from_secs(1)).await);
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Survivor;

    impl Job for Survivor {
        fn config() -> QueueConfig {
            QueueConfig::new("survivor").retention(Retention::default())
        }
    }

    #[sqlx::test]
    async fn unroutable_tasks_stay_claimed_without_wedging_the_run(
        pool_opts: SqlitePoolOptions,
        connect_opts: SqliteConnectOptions,
    ) {
        let pool = single_connection_pool(pool_opts, connect_opts).await;
        let client = client_with(&pool, 2);

        client
            .register(JobQueue::new(|_cx, Survivor| async move { Ok(()) }))
            .unwrap();

        // A row whose queue was never registered with this client.
        let ghost = pending("ghost", "missing", Timestamp::now());
        crate::task::insert_pending(&pool, &ghost).await.unwrap();

        client.start();
        client.enqueue(&Survivor).await.unwrap();

        let pool_ref = &pool;
        wait_for(|| async move { !fetch_completed(pool_ref).await.unwrap().is_empty() }).await;

        let pending_rows = fetch_pending(&pool).await.unwrap();
        assert_eq!(pending_rows.len(), 1);
        assert_eq!(pending_rows[0].id.to_string(), "ghost");
        assert!(pending_rows[0].claimed_at.is_some());

        assert!(client.stop(SignedDuration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn ready_signals_coalesce_into_one_trigger() {
        let (ready_tx, ready_rx) = mpsc::channel(READY_CAPACITY);
        let (trigger_tx, mut trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let triggered = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_coalescer(
            ready_rx,
            trigger_tx,
            triggered.clone(),
            shutdown.clone(),
            CancellationToken::new(),
        ));

        for _ in 0..50 {
            ready_tx.try_send(()).unwrap();
        }

        tokio::time::timeout(StdDuration::from_secs(1), trigger_rx.recv())
            .await
            .expect("a trigger should be emitted")
            .expect("the coalescer should be alive");

        // The burst collapsed into that single trigger.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(trigger_rx.try_recv().is_err());

        // Once a fetch resets the flag, the next signal triggers again.
        triggered.store(false, Ordering::SeqCst);
        ready_tx.try_send(()).unwrap();

        tokio::time::timeout(StdDuration::from_secs(1), trigger_rx.recv())
            .await
            .expect("a second trigger should be emitted")
            .expect("the coalescer should be alive");

        shutdown.cancel();
    }
}
