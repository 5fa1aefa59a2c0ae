//! Engines shared by every request context: response cache, pub/sub and
//! task queue, each either in-memory or log-backed.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, info};

use crate::cache::{CacheConfig, CacheEngine};
use crate::config::Settings;
use crate::error::AppError;
use crate::pubsub::{
    DurableBusOptions, DurableEventBus, EventBus, PubSubError, Subscription, SubscriptionId,
};
use crate::queue::{
    DurableQueueOptions, DurableTaskQueue, QueueError, QueueOptions, TaskHandler, TaskQueue,
};

/// Engines made available to handlers through the request context.
///
/// Cloning is cheap; every engine is reference counted.
#[derive(Clone, Default)]
pub struct Engines {
    pub cache: Option<Arc<CacheEngine>>,
    pub pubsub: Option<PubSubEngine>,
    pub queue: Option<QueueEngine>,
}

impl Engines {
    /// Build the engines enabled in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let cache = if settings.cache.enabled {
            Some(Arc::new(CacheEngine::new(CacheConfig::from(&settings.cache))?))
        } else {
            None
        };

        let pubsub_settings = &settings.pubsub;
        let pubsub = match (pubsub_settings.enabled, pubsub_settings.durable) {
            (false, _) => None,
            (true, false) => Some(PubSubEngine::Memory(Arc::new(EventBus::with_capacity(
                pubsub_settings.subscriber_capacity.get(),
            )))),
            (true, true) => Some(PubSubEngine::Durable(Arc::new(DurableEventBus::open(
                DurableBusOptions {
                    log_file: pubsub_settings.log_file.clone(),
                    subscriber_capacity: pubsub_settings.subscriber_capacity.get(),
                    compact_interval: pubsub_settings.compact_interval,
                    retention: pubsub_settings.retention,
                },
            )?))),
        };

        let queue_settings = &settings.queue;
        let options = QueueOptions {
            capacity: queue_settings.capacity.get(),
            allow_multiple_workers: queue_settings.allow_multiple_workers,
        };
        let queue = match (queue_settings.enabled, queue_settings.durable) {
            (false, _) => None,
            (true, false) => Some(QueueEngine::Memory(Arc::new(TaskQueue::new(options)))),
            (true, true) => Some(QueueEngine::Durable(Arc::new(DurableTaskQueue::open(
                DurableQueueOptions {
                    log_file: queue_settings.log_file.clone(),
                    queue: options,
                    max_retries: queue_settings.max_retries,
                    cleanup_interval: queue_settings.cleanup_interval,
                    retention: queue_settings.retention,
                },
            )?))),
        };

        info!(
            cache = cache.is_some(),
            pubsub = pubsub.as_ref().map(PubSubEngine::kind),
            queue = queue.as_ref().map(QueueEngine::kind),
            "engines ready"
        );
        Ok(Self {
            cache,
            pubsub,
            queue,
        })
    }

    /// In-memory engines with default options.
    pub fn in_memory() -> Self {
        Self {
            cache: Some(Arc::new(CacheEngine::in_memory())),
            pubsub: Some(PubSubEngine::Memory(Arc::new(EventBus::new()))),
            queue: Some(QueueEngine::Memory(Arc::new(TaskQueue::default()))),
        }
    }

    /// Close every engine: queues first so workers stop, the cache last so
    /// a persistent cache writes its final snapshot.
    pub fn close(&self) -> Result<(), AppError> {
        if let Some(queue) = &self.queue {
            queue.close();
        }
        if let Some(pubsub) = &self.pubsub {
            pubsub.close();
        }
        if let Some(cache) = &self.cache {
            cache.close()?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub enum PubSubEngine {
    Memory(Arc<EventBus>),
    Durable(Arc<DurableEventBus>),
}

impl PubSubEngine {
    fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Durable(_) => "durable",
        }
    }

    pub fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        match self {
            Self::Memory(bus) => bus.subscribe(topic),
            Self::Durable(bus) => bus.subscribe(topic),
        }
    }

    /// Publish to every current subscriber; the durable bus logs first.
    pub fn publish(&self, topic: &str, data: impl Into<Bytes>) -> Result<(), PubSubError> {
        match self {
            Self::Memory(bus) => bus.publish(topic, data).map(drop),
            Self::Durable(bus) => bus.publish(topic, data).map(drop),
        }
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        match self {
            Self::Memory(bus) => bus.unsubscribe(topic, id),
            Self::Durable(bus) => bus.unsubscribe(topic, id),
        }
    }

    pub fn unsubscribe_all(&self, topic: &str) -> usize {
        match self {
            Self::Memory(bus) => bus.unsubscribe_all(topic),
            Self::Durable(bus) => bus.unsubscribe_all(topic),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        match self {
            Self::Memory(bus) => bus.topics(),
            Self::Durable(bus) => bus.topics(),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        match self {
            Self::Memory(bus) => bus.subscriber_count(topic),
            Self::Durable(bus) => bus.subscriber_count(topic),
        }
    }

    pub fn close(&self) {
        match self {
            Self::Memory(bus) => bus.close(),
            Self::Durable(bus) => bus.close(),
        }
    }
}

#[derive(Clone)]
pub enum QueueEngine {
    Memory(Arc<TaskQueue>),
    Durable(Arc<DurableTaskQueue>),
}

impl QueueEngine {
    fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Durable(_) => "durable",
        }
    }

    /// Queue `payload`; the durable queue logs the task before accepting it.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Bytes>) -> Result<(), QueueError> {
        match self {
            Self::Memory(tasks) => tasks.enqueue(queue, payload),
            Self::Durable(tasks) => tasks.enqueue(queue, payload).map(drop),
        }
    }

    pub fn register_worker(&self, queue: &str, handler: TaskHandler) -> Result<(), QueueError> {
        let registered = match self {
            Self::Memory(tasks) => tasks.register_worker(queue, handler),
            Self::Durable(tasks) => tasks.register_worker(queue, handler),
        };
        if let Err(err) = &registered {
            error!(queue, error = %err, "worker registration failed");
        }
        registered
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        match self {
            Self::Memory(tasks) => tasks.queue_len(queue),
            Self::Durable(tasks) => tasks.queue_len(queue),
        }
    }

    pub fn queues(&self) -> Vec<String> {
        match self {
            Self::Memory(tasks) => tasks.queues(),
            Self::Durable(tasks) => tasks.queues(),
        }
    }

    pub fn close(&self) {
        match self {
            Self::Memory(tasks) => tasks.close(),
            Self::Durable(tasks) => tasks.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::queue::{TaskError, task_handler};

    #[tokio::test]
    async fn default_settings_build_memory_engines() {
        let engines = Engines::from_settings(&Settings::test_defaults()).expect("engines");

        assert!(engines.cache.is_some());
        assert!(matches!(engines.pubsub, Some(PubSubEngine::Memory(_))));
        assert!(matches!(engines.queue, Some(QueueEngine::Memory(_))));
        engines.close().expect("close");
    }

    #[tokio::test]
    async fn durable_settings_open_logs() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut settings = Settings::test_defaults();
        settings.cache.enabled = false;
        settings.pubsub.durable = true;
        settings.pubsub.log_file = dir.path().join("pubsub.log");
        settings.queue.durable = true;
        settings.queue.log_file = dir.path().join("queue.log");

        let engines = Engines::from_settings(&settings).expect("engines");
        assert!(engines.cache.is_none());

        let pubsub = engines.pubsub.clone().expect("pubsub");
        let mut subscription = pubsub.subscribe("news").expect("subscribe");
        pubsub.publish("news", "hello").expect("publish");
        assert_eq!(subscription.recv().await, Some(Bytes::from("hello")));

        let queue = engines.queue.clone().expect("queue");
        queue.enqueue("mail", "welcome").expect("enqueue");
        assert!(dir.path().join("queue.log").exists());
        assert!(dir.path().join("pubsub.log").exists());
        engines.close().expect("close");
    }

    #[tokio::test]
    async fn queue_engine_runs_workers_and_rejects_after_close() {
        let engines = Engines::in_memory();
        let queue = engines.queue.clone().expect("queue");
        let (done, mut finished) = mpsc::unbounded_channel();
        queue
            .register_worker(
                "jobs",
                task_handler(move |payload| {
                    let done = done.clone();
                    async move {
                        done.send(payload).map_err(|_| TaskError::new("receiver gone"))
                    }
                }),
            )
            .expect("worker");

        queue.enqueue("jobs", "one").expect("enqueue");
        let handled = tokio::time::timeout(Duration::from_secs(1), finished.recv())
            .await
            .expect("handled in time");
        assert_eq!(handled, Some(Bytes::from("one")));
        assert_eq!(queue.queues(), vec!["jobs".to_string()]);

        engines.close().expect("close");
        assert!(matches!(queue.enqueue("jobs", "two"), Err(QueueError::Closed)));
    }
}
