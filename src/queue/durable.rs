use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::QueueError;
use super::memory::{
    Envelope, METRIC_QUEUE_ENQUEUED, Outcome, QueueOptions, Runner, TaskQueue, run_guarded,
    send_error,
};
use super::task::{Task, TaskHandler, TaskStats, TaskStatus};
use crate::store::AppendLog;
use crate::util::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "queue::durable";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct DurableQueueOptions {
    pub log_file: PathBuf,
    pub queue: QueueOptions,
    /// Failed tasks with fewer retries than this are re-enqueued on open.
    pub max_retries: u32,
    /// Zero disables the background cleanup loop.
    pub cleanup_interval: Duration,
    /// Completed tasks older than this are removed by the cleanup loop.
    pub retention: Duration,
}

impl DurableQueueOptions {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            queue: QueueOptions::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }
}

struct Shared {
    inner: TaskQueue,
    log: AppendLog,
    tasks: RwLock<BTreeMap<u64, Task>>,
    /// Id of the next task. Held from id assignment through the pending
    /// record's append so the log stays in id order.
    next_id: Mutex<u64>,
}

impl Shared {
    /// Update a task's status in memory, then log the new state.
    ///
    /// The task map lock is released before the log is touched.
    fn transition(&self, id: u64, status: TaskStatus) {
        let snapshot = {
            let mut tasks = rw_write(&self.tasks, SOURCE, "transition");
            let Some(task) = tasks.get_mut(&id) else {
                warn!(task_id = id, "status change for unknown task ignored");
                return;
            };
            task.status = status;
            if status == TaskStatus::Failed {
                task.retries += 1;
            }
            task.clone()
        };

        if let Err(err) = self.log.append(&snapshot) {
            error!(
                task_id = id,
                queue = %snapshot.queue,
                error = %err,
                "failed to log task status"
            );
        }
    }

    fn cleanup(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = cutoff(older_than);
        let expired = |task: &Task| task.status == TaskStatus::Completed && task.timestamp < cutoff;

        let next_id = mutex_lock(&self.next_id, SOURCE, "cleanup");
        let issued = next_id.saturating_sub(1);
        let removed = {
            let mut tasks = rw_write(&self.tasks, SOURCE, "cleanup");
            let before = tasks.len();
            tasks.retain(|_, task| !expired(task));
            before - tasks.len()
        };

        self.log.rewrite_marked(issued, |records: Vec<Task>| {
            latest_by_id(records)
                .into_values()
                .filter(|task| !expired(task))
                .collect()
        })?;
        Ok(removed)
    }
}

fn cutoff(age: Duration) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    time::Duration::try_from(age)
        .ok()
        .and_then(|age| now.checked_sub(age))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn latest_by_id(records: Vec<Task>) -> BTreeMap<u64, Task> {
    let mut latest = BTreeMap::new();
    for task in records {
        latest.insert(task.id, task);
    }
    latest
}

/// [`TaskQueue`] that records each task and status change in an append log.
///
/// Enqueue is acknowledged only after the pending record is fsynced. On open,
/// tasks that were pending, interrupted while processing, or failed fewer
/// than `max_retries` times are put back on their queues.
pub struct DurableTaskQueue {
    shared: Arc<Shared>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl DurableTaskQueue {
    pub fn open(options: DurableQueueOptions) -> Result<Self, QueueError> {
        let log = AppendLog::open(&options.log_file)?;
        let (records, high_water) = log.read_marked::<Task>()?;
        let tasks = latest_by_id(records);
        let next_id = tasks
            .keys()
            .next_back()
            .copied()
            .into_iter()
            .chain(high_water)
            .max()
            .unwrap_or(0)
            + 1;

        let shared = Arc::new(Shared {
            inner: TaskQueue::new(options.queue.clone()),
            log,
            tasks: RwLock::new(tasks),
            next_id: Mutex::new(next_id),
        });

        let recovered = recover(&shared, options.max_retries);
        info!(
            path = %options.log_file.display(),
            recovered,
            next_id,
            "durable task queue opened"
        );

        let cleaner = match Handle::try_current() {
            Ok(handle) if !options.cleanup_interval.is_zero() => Some(handle.spawn(
                cleanup_loop(
                    Arc::downgrade(&shared),
                    options.cleanup_interval,
                    options.retention,
                ),
            )),
            _ => None,
        };

        Ok(Self {
            shared,
            cleaner: Mutex::new(cleaner),
        })
    }

    /// Log a pending task and buffer it on `queue`. Returns the task id.
    ///
    /// Capacity is reserved before logging, so a full queue leaves no record.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Bytes>) -> Result<u64, QueueError> {
        let sender = self.shared.inner.sender(queue)?;
        let permit = sender.try_reserve().map_err(|err| match err {
            tokio::sync::mpsc::error::TrySendError::Full(()) => QueueError::Full {
                queue: queue.to_string(),
            },
            tokio::sync::mpsc::error::TrySendError::Closed(()) => QueueError::Closed,
        })?;

        let mut next_id = mutex_lock(&self.shared.next_id, SOURCE, "enqueue");
        let task = Task {
            id: *next_id,
            queue: queue.to_string(),
            data: payload.into(),
            timestamp: OffsetDateTime::now_utc(),
            status: TaskStatus::Pending,
            retries: 0,
        };
        self.shared.log.append(&task)?;
        *next_id += 1;

        let id = task.id;
        let payload = task.data.clone();
        rw_write(&self.shared.tasks, SOURCE, "enqueue").insert(id, task);
        permit.send(Envelope {
            id: Some(id),
            payload,
        });
        drop(next_id);

        counter!(METRIC_QUEUE_ENQUEUED).increment(1);
        debug!(queue, task_id = id, "durable task enqueued");
        Ok(id)
    }

    /// Start a worker for `queue` that records each task's status as it runs.
    ///
    /// Errors and panics mark the task failed and bump its retry count.
    pub fn register_worker(&self, queue: &str, handler: TaskHandler) -> Result<(), QueueError> {
        let name: Arc<str> = Arc::from(queue);
        let shared = Arc::downgrade(&self.shared);
        let runner: Runner = Arc::new(move |envelope: Envelope| {
            let handler = Arc::clone(&handler);
            let name = Arc::clone(&name);
            let shared = Weak::clone(&shared);
            Box::pin(async move {
                let Some(id) = envelope.id else {
                    run_guarded(&name, &handler, envelope.payload).await;
                    return;
                };
                if let Some(shared) = shared.upgrade() {
                    shared.transition(id, TaskStatus::Processing);
                }
                let outcome = run_guarded(&name, &handler, envelope.payload).await;
                let status = match outcome {
                    Outcome::Completed => TaskStatus::Completed,
                    Outcome::Failed => TaskStatus::Failed,
                };
                if let Some(shared) = shared.upgrade() {
                    shared.transition(id, status);
                }
            })
        });
        self.shared.inner.register_runner(queue, runner)
    }

    pub fn task(&self, id: u64) -> Option<Task> {
        rw_read(&self.shared.tasks, SOURCE, "task").get(&id).cloned()
    }

    pub fn stats(&self, queue: &str) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in rw_read(&self.shared.tasks, SOURCE, "stats").values() {
            if task.queue == queue {
                stats.record(task.status);
            }
        }
        stats
    }

    /// The most recent `limit` tasks of `queue`, oldest first. An empty
    /// `queue` matches every queue; a `limit` of zero returns all of them.
    pub fn history(&self, queue: &str, limit: usize) -> Vec<Task> {
        let mut tasks: Vec<Task> = rw_read(&self.shared.tasks, SOURCE, "history")
            .values()
            .filter(|task| queue.is_empty() || task.queue == queue)
            .cloned()
            .collect();
        if limit > 0 && tasks.len() > limit {
            tasks.drain(..tasks.len() - limit);
        }
        tasks
    }

    /// Forget completed tasks created more than `older_than` ago and rewrite
    /// the log without them. Returns how many were removed.
    pub fn cleanup(&self, older_than: Duration) -> Result<usize, QueueError> {
        self.shared.cleanup(older_than)
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared.inner.queue_len(queue)
    }

    pub fn queues(&self) -> Vec<String> {
        self.shared.inner.queues()
    }

    pub fn worker_count(&self, queue: &str) -> usize {
        self.shared.inner.worker_count(queue)
    }

    /// Stop cleanup and workers. Tasks that did not finish stay in the log
    /// and are recovered by the next [`DurableTaskQueue::open`].
    pub fn close(&self) {
        if let Some(task) = mutex_lock(&self.cleaner, SOURCE, "close").take() {
            task.abort();
        }
        self.shared.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.is_closed()
    }
}

impl Drop for DurableTaskQueue {
    fn drop(&mut self) {
        if let Some(task) = mutex_lock(&self.cleaner, SOURCE, "drop").take() {
            task.abort();
        }
    }
}

fn recover(shared: &Shared, max_retries: u32) -> usize {
    let candidates: Vec<Task> = rw_read(&shared.tasks, SOURCE, "recover")
        .values()
        .filter(|task| match task.status {
            TaskStatus::Pending | TaskStatus::Processing => true,
            TaskStatus::Failed => task.retries < max_retries,
            TaskStatus::Completed => false,
        })
        .cloned()
        .collect();

    let mut recovered = 0;
    for task in candidates {
        if task.status != TaskStatus::Pending {
            shared.transition(task.id, TaskStatus::Pending);
        }
        let sent = shared.inner.sender(&task.queue).and_then(|sender| {
            sender
                .try_send(Envelope {
                    id: Some(task.id),
                    payload: task.data.clone(),
                })
                .map_err(|err| send_error(&task.queue, err))
        });
        match sent {
            Ok(()) => recovered += 1,
            Err(err) => warn!(
                task_id = task.id,
                queue = %task.queue,
                error = %err,
                "could not re-enqueue recovered task"
            ),
        }
    }
    recovered
}

async fn cleanup_loop(shared: Weak<Shared>, period: Duration, retention: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.inner.is_closed() {
            break;
        }
        let outcome = tokio::task::spawn_blocking({
            let shared = Arc::clone(&shared);
            move || shared.cleanup(retention)
        })
        .await;
        match outcome {
            Ok(Ok(removed)) if removed > 0 => info!(removed, "completed tasks cleaned up"),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(error = %err, "task cleanup failed"),
            Err(join) => error!(error = %join, "task cleanup task failed"),
        }
    }
}
