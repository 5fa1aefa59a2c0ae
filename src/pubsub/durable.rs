use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::bus::{DEFAULT_SUBSCRIBER_CAPACITY, EventBus, Subscription, SubscriptionId};
use super::PubSubError;
use crate::store::AppendLog;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "pubsub::durable";

const DEFAULT_COMPACT_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// One published message as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub topic: String,
    #[serde(with = "crate::util::bytes")]
    pub data: Bytes,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct DurableBusOptions {
    pub log_file: PathBuf,
    pub subscriber_capacity: usize,
    /// Zero disables the background compaction loop.
    pub compact_interval: Duration,
    pub retention: Duration,
}

impl DurableBusOptions {
    pub fn new(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            compact_interval: DEFAULT_COMPACT_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }
}

struct Shared {
    bus: EventBus,
    log: AppendLog,
    /// Id of the next message. Held from id assignment through fan-out so
    /// log order, id order and delivery order agree.
    next_id: Mutex<u64>,
    replaying: AtomicBool,
}

impl Shared {
    fn compact(&self, retention: Duration) -> Result<usize, PubSubError> {
        let cutoff = cutoff(retention);
        let mut removed = 0;
        let next_id = mutex_lock(&self.next_id, SOURCE, "compact");
        let issued = next_id.saturating_sub(1);
        self.log.rewrite_marked(issued, |messages: Vec<Message>| {
            let before = messages.len();
            let kept: Vec<Message> = messages
                .into_iter()
                .filter(|message| message.timestamp >= cutoff)
                .collect();
            removed = before - kept.len();
            kept
        })?;
        Ok(removed)
    }
}

fn cutoff(retention: Duration) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    time::Duration::try_from(retention)
        .ok()
        .and_then(|retention| now.checked_sub(retention))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// [`EventBus`] whose messages are appended to a log before fan-out.
///
/// Publishing is acknowledged only after the record is fsynced. Message ids
/// keep increasing across restarts.
pub struct DurableEventBus {
    shared: Arc<Shared>,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

impl DurableEventBus {
    pub fn open(options: DurableBusOptions) -> Result<Self, PubSubError> {
        let log = AppendLog::open(&options.log_file)?;
        let (existing, high_water) = log.read_marked::<Message>()?;
        let next_id = existing
            .iter()
            .map(|m| m.id)
            .chain(high_water)
            .max()
            .unwrap_or(0)
            + 1;

        info!(
            path = %options.log_file.display(),
            messages = existing.len(),
            next_id,
            "durable event bus opened"
        );

        let shared = Arc::new(Shared {
            bus: EventBus::with_capacity(options.subscriber_capacity),
            log,
            next_id: Mutex::new(next_id),
            replaying: AtomicBool::new(false),
        });

        let compactor = match Handle::try_current() {
            Ok(handle) if !options.compact_interval.is_zero() => Some(handle.spawn(
                compact_loop(
                    Arc::downgrade(&shared),
                    options.compact_interval,
                    options.retention,
                ),
            )),
            _ => None,
        };

        Ok(Self {
            shared,
            compactor: Mutex::new(compactor),
        })
    }

    pub fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        self.shared.bus.subscribe(topic)
    }

    /// Log the message, then deliver it to current subscribers. Returns the
    /// message id.
    ///
    /// While a [`DurableEventBus::replay`] is running the message is logged
    /// but not delivered, so subscribers see only the replayed stream.
    pub fn publish(&self, topic: &str, data: impl Into<Bytes>) -> Result<u64, PubSubError> {
        if topic.is_empty() {
            return Err(PubSubError::InvalidTopic);
        }
        if self.shared.bus.is_closed() {
            return Err(PubSubError::Closed);
        }

        let mut next_id = mutex_lock(&self.shared.next_id, SOURCE, "publish");
        let message = Message {
            id: *next_id,
            topic: topic.to_string(),
            data: data.into(),
            timestamp: OffsetDateTime::now_utc(),
        };
        self.shared.log.append(&message)?;
        *next_id += 1;

        if self.is_replaying() {
            debug!(topic, message_id = message.id, "logged during replay, not delivered");
            return Ok(message.id);
        }
        self.shared.bus.publish(topic, message.data)?;
        Ok(message.id)
    }

    /// Re-deliver logged messages with `from <= timestamp <= to` to current
    /// subscribers, in log order. Replayed messages are not logged again.
    pub fn replay(&self, from: OffsetDateTime, to: OffsetDateTime) -> Result<usize, PubSubError> {
        if self.shared.bus.is_closed() {
            return Err(PubSubError::Closed);
        }
        let messages: Vec<Message> = self.shared.log.read_all()?;

        self.shared.replaying.store(true, Ordering::Release);
        let mut replayed = 0;
        let mut outcome = Ok(());
        for message in messages
            .into_iter()
            .filter(|m| m.timestamp >= from && m.timestamp <= to)
        {
            if let Err(err) = self.shared.bus.publish(&message.topic, message.data) {
                outcome = Err(err);
                break;
            }
            replayed += 1;
        }
        self.shared.replaying.store(false, Ordering::Release);

        outcome?;
        debug!(replayed, "replay finished");
        Ok(replayed)
    }

    /// Whether a [`DurableEventBus::replay`] is re-driving history right now.
    pub fn is_replaying(&self) -> bool {
        self.shared.replaying.load(Ordering::Acquire)
    }

    /// The most recent `limit` logged messages of `topic`, oldest first.
    /// An empty `topic` matches every topic; a `limit` of zero returns all
    /// of them.
    pub fn history(&self, topic: &str, limit: usize) -> Result<Vec<Message>, PubSubError> {
        let mut messages: Vec<Message> = self
            .shared
            .log
            .read_all::<Message>()?
            .into_iter()
            .filter(|m| topic.is_empty() || m.topic == topic)
            .collect();
        if limit > 0 && messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    /// Drop logged messages older than `retention`. Returns how many went.
    pub fn compact(&self, retention: Duration) -> Result<usize, PubSubError> {
        self.shared.compact(retention)
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(topic, id)
    }

    pub fn unsubscribe_all(&self, topic: &str) -> usize {
        self.shared.bus.unsubscribe_all(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.shared.bus.topics()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared.bus.subscriber_count(topic)
    }

    pub fn close(&self) {
        if let Some(task) = mutex_lock(&self.compactor, SOURCE, "close").take() {
            task.abort();
        }
        self.shared.bus.close();
    }
}

impl Drop for DurableEventBus {
    fn drop(&mut self) {
        if let Some(task) = mutex_lock(&self.compactor, SOURCE, "drop").take() {
            task.abort();
        }
    }
}

async fn compact_loop(shared: Weak<Shared>, period: Duration, retention: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.bus.is_closed() {
            break;
        }
        let outcome = tokio::task::spawn_blocking({
            let shared = Arc::clone(&shared);
            move || shared.compact(retention)
        })
        .await;
        match outcome {
            Ok(Ok(removed)) if removed > 0 => info!(removed, "pubsub log compacted"),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(error = %err, "pubsub log compaction failed"),
            Err(join) => error!(error = %join, "pubsub compaction task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> DurableBusOptions {
        DurableBusOptions::new(dir.path().join("pubsub.log"))
    }

    #[tokio::test]
    async fn publish_logs_and_delivers() {
        let dir = TempDir::new().expect("tempdir");
        let bus = DurableEventBus::open(options(&dir)).expect("open");
        let mut subscription = bus.subscribe("orders").expect("subscribe");

        let id = bus.publish("orders", "created").expect("publish");

        assert_eq!(id, 1);
        assert_eq!(subscription.recv().await, Some(Bytes::from("created")));
        let history = bus.history("orders", 0).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data, Bytes::from("created"));
    }

    #[tokio::test]
    async fn reopen_keeps_history_and_resumes_ids() {
        let dir = TempDir::new().expect("tempdir");
        {
            let bus = DurableEventBus::open(options(&dir)).expect("open");
            for n in 0..3 {
                bus.publish("t", format!("m{n}")).expect("publish");
            }
            bus.close();
        }

        let bus = DurableEventBus::open(options(&dir)).expect("reopen");
        let history = bus.history("t", 0).expect("history");
        let payloads: Vec<Bytes> = history.iter().map(|m| m.data.clone()).collect();
        assert_eq!(
            payloads,
            vec![Bytes::from("m0"), Bytes::from("m1"), Bytes::from("m2")]
        );
        assert_eq!(bus.publish("t", "m3").expect("publish"), 4);
    }

    #[tokio::test]
    async fn history_limit_keeps_most_recent() {
        let dir = TempDir::new().expect("tempdir");
        let bus = DurableEventBus::open(options(&dir)).expect("open");
        for n in 0..5 {
            bus.publish("t", format!("m{n}")).expect("publish");
        }
        bus.publish("other", "x").expect("publish");

        let history = bus.history("t", 2).expect("history");
        let ids: Vec<u64> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn replay_redrives_range_without_relogging() {
        let dir = TempDir::new().expect("tempdir");
        let bus = DurableEventBus::open(options(&dir)).expect("open");
        let start = OffsetDateTime::now_utc() - time::Duration::seconds(1);
        bus.publish("t", "a").expect("publish");
        bus.publish("t", "b").expect("publish");

        let mut late = bus.subscribe("t").expect("subscribe");
        let replayed = bus
            .replay(start, OffsetDateTime::now_utc() + time::Duration::seconds(1))
            .expect("replay");

        assert_eq!(replayed, 2);
        assert_eq!(late.recv().await, Some(Bytes::from("a")));
        assert_eq!(late.recv().await, Some(Bytes::from("b")));
        assert!(!bus.is_replaying());
        assert_eq!(bus.history("t", 0).expect("history").len(), 2);
    }

    #[tokio::test]
    async fn replay_outside_range_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let bus = DurableEventBus::open(options(&dir)).expect("open");
        bus.publish("t", "a").expect("publish");

        let past = OffsetDateTime::now_utc() - time::Duration::hours(2);
        let replayed = bus
            .replay(past, past + time::Duration::hours(1))
            .expect("replay");
        assert_eq!(replayed, 0);
    }

    #[tokio::test]
    async fn compact_drops_old_messages() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("pubsub.log");
        {
            let log = AppendLog::open(&path).expect("log");
            log.append(&Message {
                id: 1,
                topic: "t".into(),
                data: Bytes::from("old"),
                timestamp: OffsetDateTime::now_utc() - time::Duration::days(2),
            })
            .expect("append");
        }

        let bus = DurableEventBus::open(DurableBusOptions::new(&path)).expect("open");
        bus.publish("t", "new").expect("publish");

        let removed = bus.compact(Duration::from_secs(24 * 60 * 60)).expect("compact");
        assert_eq!(removed, 1);
        let history = bus.history("t", 0).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data, Bytes::from("new"));
        assert_eq!(history[0].id, 2);
    }

    #[test]
    fn concurrent_publishers_log_in_id_order() {
        let dir = TempDir::new().expect("tempdir");
        let bus = Arc::new(DurableEventBus::open(options(&dir)).expect("open"));

        let publishers: Vec<_> = (0..8)
            .map(|n| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        bus.publish(&format!("t{n}"), format!("{i}")).expect("publish");
                    }
                })
            })
            .collect();
        for publisher in publishers {
            publisher.join().expect("publisher");
        }

        let ids: Vec<u64> = bus
            .history("", 0)
            .expect("history")
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, (1..=400).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_compacting_everything() {
        let dir = TempDir::new().expect("tempdir");
        {
            let bus = DurableEventBus::open(options(&dir)).expect("open");
            bus.publish("t", "a").expect("publish");
            bus.publish("t", "b").expect("publish");
            assert_eq!(bus.compact(Duration::ZERO).expect("compact"), 2);
            bus.close();
        }

        let bus = DurableEventBus::open(options(&dir)).expect("reopen");
        assert!(bus.history("t", 0).expect("history").is_empty());
        assert_eq!(bus.publish("t", "c").expect("publish"), 3);

        bus.compact(Duration::from_secs(60)).expect("compact");
        drop(bus);
        let bus = DurableEventBus::open(options(&dir)).expect("reopen");
        assert_eq!(bus.publish("t", "d").expect("publish"), 4);
    }

    #[tokio::test]
    async fn live_publishes_during_replay_are_logged_but_not_delivered() {
        let dir = TempDir::new().expect("tempdir");
        let bus = DurableEventBus::open(options(&dir)).expect("open");
        let mut subscription = bus.subscribe("t").expect("subscribe");

        bus.shared.replaying.store(true, Ordering::Release);
        bus.publish("t", "during").expect("publish");
        bus.shared.replaying.store(false, Ordering::Release);
        bus.publish("t", "after").expect("publish");

        assert_eq!(subscription.recv().await, Some(Bytes::from("after")));
        assert!(subscription.try_recv().is_err());
        let logged: Vec<Bytes> = bus
            .history("t", 0)
            .expect("history")
            .into_iter()
            .map(|m| m.data)
            .collect();
        assert_eq!(logged, vec![Bytes::from("during"), Bytes::from("after")]);
    }

    #[tokio::test]
    async fn empty_topic_history_spans_all_topics() {
        let dir = TempDir::new().expect("tempdir");
        let bus = DurableEventBus::open(options(&dir)).expect("open");
        bus.publish("a", "1").expect("publish");
        bus.publish("b", "2").expect("publish");
        bus.publish("a", "3").expect("publish");

        let topics: Vec<String> = bus
            .history("", 2)
            .expect("history")
            .into_iter()
            .map(|m| m.topic)
            .collect();
        assert_eq!(topics, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let dir = TempDir::new().expect("tempdir");
        let bus = DurableEventBus::open(options(&dir)).expect("open");
        bus.close();

        assert!(matches!(bus.publish("t", "x"), Err(PubSubError::Closed)));
        assert!(bus.history("t", 0).expect("history").is_empty());
    }
}
