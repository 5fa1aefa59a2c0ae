use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::QueueError;
use super::task::TaskHandler;
use crate::util::lock::{rw_read, rw_write};
use crate::util::panic::panic_message;

const SOURCE: &str = "queue::memory";

pub(crate) const METRIC_QUEUE_ENQUEUED: &str = "turbine_queue_enqueued_total";
pub(crate) const METRIC_QUEUE_HANDLER_PANIC: &str = "turbine_queue_handler_panic_total";
pub(crate) const METRIC_QUEUE_HANDLER_FAILED: &str = "turbine_queue_handler_failed_total";

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Buffered payloads per queue; zero is raised to one.
    pub capacity: usize,
    pub allow_multiple_workers: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            allow_multiple_workers: false,
        }
    }
}

/// Item travelling through a queue channel. `id` is set for durable tasks.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) id: Option<u64>,
    pub(crate) payload: Bytes,
}

pub(crate) type Runner = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) enum Outcome {
    Completed,
    Failed,
}

struct Worker {
    cancel: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

struct Lane {
    sender: mpsc::Sender<Envelope>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Envelope>>>,
    workers: Vec<Worker>,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            workers: Vec::new(),
        }
    }
}

/// In-memory task queues keyed by name.
///
/// Each queue is created on first use. Workers share the queue's receiver, so
/// with several workers there is no ordering guarantee; with one worker
/// payloads are handled in enqueue order.
pub struct TaskQueue {
    lanes: RwLock<HashMap<String, Lane>>,
    options: QueueOptions,
    closed: AtomicBool,
}

impl TaskQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            options: QueueOptions {
                capacity: options.capacity.max(1),
                ..options
            },
            closed: AtomicBool::new(false),
        }
    }

    /// Buffer `payload` on `queue` without waiting.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Bytes>) -> Result<(), QueueError> {
        let sender = self.sender(queue)?;
        sender
            .try_send(Envelope {
                id: None,
                payload: payload.into(),
            })
            .map_err(|err| send_error(queue, err))?;

        counter!(METRIC_QUEUE_ENQUEUED).increment(1);
        debug!(queue, "task enqueued");
        Ok(())
    }

    /// Start a worker that feeds every payload of `queue` to `handler`.
    ///
    /// Handler errors and panics are logged and the worker moves on to the
    /// next payload.
    pub fn register_worker(&self, queue: &str, handler: TaskHandler) -> Result<(), QueueError> {
        let name: Arc<str> = Arc::from(queue);
        let runner: Runner = Arc::new(move |envelope: Envelope| {
            let handler = Arc::clone(&handler);
            let name = Arc::clone(&name);
            Box::pin(async move {
                run_guarded(&name, &handler, envelope.payload).await;
            })
        });
        self.register_runner(queue, runner)
    }

    pub(crate) fn sender(&self, queue: &str) -> Result<mpsc::Sender<Envelope>, QueueError> {
        validate_queue(queue)?;
        {
            let lanes = rw_read(&self.lanes, SOURCE, "sender");
            if self.is_closed() {
                return Err(QueueError::Closed);
            }
            if let Some(lane) = lanes.get(queue) {
                return Ok(lane.sender.clone());
            }
        }

        let mut lanes = rw_write(&self.lanes, SOURCE, "sender_create");
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let lane = lanes
            .entry(queue.to_string())
            .or_insert_with(|| Lane::new(self.options.capacity));
        Ok(lane.sender.clone())
    }

    pub(crate) fn register_runner(&self, queue: &str, runner: Runner) -> Result<(), QueueError> {
        validate_queue(queue)?;
        let handle = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;

        let mut lanes = rw_write(&self.lanes, SOURCE, "register_worker");
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let lane = lanes
            .entry(queue.to_string())
            .or_insert_with(|| Lane::new(self.options.capacity));
        if !self.options.allow_multiple_workers && !lane.workers.is_empty() {
            return Err(QueueError::DuplicateWorker {
                queue: queue.to_string(),
            });
        }

        let (cancel, cancelled) = watch::channel(false);
        let task = handle.spawn(worker_loop(
            queue.to_string(),
            Arc::clone(&lane.receiver),
            cancelled,
            runner,
        ));
        lane.workers.push(Worker { cancel, _task: task });

        info!(queue, workers = lane.workers.len(), "worker registered");
        Ok(())
    }

    /// Payloads currently buffered on `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        rw_read(&self.lanes, SOURCE, "queue_len")
            .get(queue)
            .map_or(0, |lane| lane.sender.max_capacity() - lane.sender.capacity())
    }

    /// Names of all queues created so far, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = rw_read(&self.lanes, SOURCE, "queues")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn worker_count(&self, queue: &str) -> usize {
        rw_read(&self.lanes, SOURCE, "worker_count")
            .get(queue)
            .map_or(0, |lane| lane.workers.len())
    }

    /// Reject new work, signal every worker to stop, and drop all queues.
    ///
    /// A handler already running finishes; buffered payloads are discarded.
    pub fn close(&self) {
        let mut lanes = rw_write(&self.lanes, SOURCE, "close");
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = 0;
        for (_, lane) in lanes.drain() {
            for worker in lane.workers {
                workers += 1;
                let _ = worker.cancel.send(true);
            }
        }
        info!(workers, "task queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

fn validate_queue(queue: &str) -> Result<(), QueueError> {
    if queue.is_empty() {
        Err(QueueError::InvalidQueueName)
    } else {
        Ok(())
    }
}

pub(crate) fn send_error(queue: &str, err: TrySendError<Envelope>) -> QueueError {
    match err {
        TrySendError::Full(_) => QueueError::Full {
            queue: queue.to_string(),
        },
        TrySendError::Closed(_) => QueueError::Closed,
    }
}

/// Run `handler` on `payload`, turning errors and panics into an outcome.
pub(crate) async fn run_guarded(queue: &str, handler: &TaskHandler, payload: Bytes) -> Outcome {
    let call = AssertUnwindSafe(async { handler(payload).await })
        .catch_unwind()
        .await;

    match call {
        Ok(Ok(())) => Outcome::Completed,
        Ok(Err(err)) => {
            counter!(METRIC_QUEUE_HANDLER_FAILED).increment(1);
            warn!(queue, error = %err, "task handler failed");
            Outcome::Failed
        }
        Err(panic) => {
            counter!(METRIC_QUEUE_HANDLER_PANIC).increment(1);
            let message = panic_message(panic.as_ref());
            error!(queue, panic = %message, "task handler panicked");
            Outcome::Failed
        }
    }
}

async fn worker_loop(
    queue: String,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Envelope>>>,
    mut cancelled: watch::Receiver<bool>,
    runner: Runner,
) {
    debug!(queue = %queue, "worker started");
    loop {
        if *cancelled.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = cancelled.changed() => None,
            envelope = async { receiver.lock().await.recv().await } => envelope,
        };
        let Some(envelope) = next else {
            break;
        };
        runner(envelope).await;
    }
    debug!(queue = %queue, "worker stopped");
}
