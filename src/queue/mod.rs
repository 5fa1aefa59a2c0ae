//! Named work queues drained by background workers.
//!
//! [`TaskQueue`] keeps payloads in bounded in-memory channels;
//! [`DurableTaskQueue`] additionally records every task and its status
//! transitions in an append log and re-enqueues unfinished work on restart.
//! Delivery is at-least-once.

mod durable;
mod memory;
mod task;

use thiserror::Error;

use crate::store::LogError;

pub use durable::{DurableQueueOptions, DurableTaskQueue};
pub use memory::{DEFAULT_QUEUE_CAPACITY, QueueOptions, TaskQueue};
pub use task::{Task, TaskError, TaskHandler, TaskStats, TaskStatus, task_handler};

pub(crate) use memory::{
    METRIC_QUEUE_ENQUEUED, METRIC_QUEUE_HANDLER_FAILED, METRIC_QUEUE_HANDLER_PANIC,
};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue name must not be empty")]
    InvalidQueueName,
    #[error("task queue is closed")]
    Closed,
    #[error("queue `{queue}` is full")]
    Full { queue: String },
    #[error("queue `{queue}` already has a worker")]
    DuplicateWorker { queue: String },
    #[error("workers can only be registered inside a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Log(#[from] LogError),
}
