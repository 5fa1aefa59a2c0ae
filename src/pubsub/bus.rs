use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use metrics::counter;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, info};

use super::PubSubError;
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "pubsub::bus";

pub(crate) const METRIC_PUBSUB_DROPPED: &str = "turbine_pubsub_dropped_total";

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of one subscription.
///
/// Yields every message published to the topic after the subscription was
/// made, in publish order. `recv` returns `None` once the subscription is
/// removed or the bus is closed and the buffer is drained.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    receiver: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Bytes, TryRecvError> {
        self.receiver.try_recv()
    }
}

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Bytes>,
}

/// In-memory fan-out bus. Delivery is at-most-once per subscriber.
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// `capacity` bounds each subscriber's buffer; zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        validate_topic(topic)?;
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut topics = rw_write(&self.topics, SOURCE, "subscribe");
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sender });
        drop(topics);

        debug!(topic, subscription = %id, "subscribed");
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            receiver,
        })
    }

    /// Deliver `data` to every current subscriber of `topic` without waiting.
    ///
    /// Returns how many subscribers accepted the message. Subscribers whose
    /// buffer is full miss this message; subscribers that dropped their
    /// receiver are pruned.
    pub fn publish(&self, topic: &str, data: impl Into<Bytes>) -> Result<usize, PubSubError> {
        validate_topic(topic)?;
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        let data = data.into();

        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let topics = rw_read(&self.topics, SOURCE, "publish");
            let Some(subscribers) = topics.get(topic) else {
                return Ok(0);
            };
            for subscriber in subscribers {
                match subscriber.sender.try_send(data.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        counter!(METRIC_PUBSUB_DROPPED).increment(1);
                        debug!(
                            topic,
                            subscription = %subscriber.id,
                            "subscriber buffer full; message dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => gone.push(subscriber.id),
                }
            }
        }

        if !gone.is_empty() {
            let mut topics = rw_write(&self.topics, SOURCE, "publish_prune");
            remove_subscribers(&mut topics, topic, |id| gone.contains(&id));
        }

        Ok(delivered)
    }

    /// Remove one subscription; its receiver then sees the end of the stream.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = rw_write(&self.topics, SOURCE, "unsubscribe");
        remove_subscribers(&mut topics, topic, |candidate| candidate == id) > 0
    }

    /// Remove every subscription of `topic`, returning how many were removed.
    pub fn unsubscribe_all(&self, topic: &str) -> usize {
        let removed = rw_write(&self.topics, SOURCE, "unsubscribe_all")
            .remove(topic)
            .map_or(0, |subscribers| subscribers.len());
        if removed > 0 {
            debug!(topic, removed, "topic cleared");
        }
        removed
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = rw_read(&self.topics, SOURCE, "topics")
            .iter()
            .filter(|(_, subscribers)| !subscribers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        rw_read(&self.topics, SOURCE, "subscriber_count")
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Reject further publishes and subscriptions and end every subscription.
    pub fn close(&self) {
        let mut topics = rw_write(&self.topics, SOURCE, "close");
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscribers: usize = topics.values().map(Vec::len).sum();
        topics.clear();
        info!(subscribers, "event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_topic(topic: &str) -> Result<(), PubSubError> {
    if topic.is_empty() {
        Err(PubSubError::InvalidTopic)
    } else {
        Ok(())
    }
}

fn remove_subscribers<F>(
    topics: &mut HashMap<String, Vec<Subscriber>>,
    topic: &str,
    mut matches: F,
) -> usize
where
    F: FnMut(SubscriptionId) -> bool,
{
    let Some(subscribers) = topics.get_mut(topic) else {
        return 0;
    };
    let before = subscribers.len();
    subscribers.retain(|subscriber| !matches(subscriber.id));
    let removed = before - subscribers.len();
    if subscribers.is_empty() {
        topics.remove(topic);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_one_copy() {
        let bus = EventBus::new();
        let mut subscriptions: Vec<Subscription> = (0..5)
            .map(|_| bus.subscribe("news").expect("subscribe"))
            .collect();

        let delivered = bus.publish("news", "hello").expect("publish");
        assert_eq!(delivered, 5);

        for subscription in &mut subscriptions {
            assert_eq!(subscription.recv().await, Some(Bytes::from("hello")));
            assert!(matches!(subscription.try_recv(), Err(TryRecvError::Empty)));
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_later_messages_in_order() {
        let bus = EventBus::new();
        bus.publish("t", "before").expect("publish");

        let mut subscription = bus.subscribe("t").expect("subscribe");
        bus.publish("t", "one").expect("publish");
        bus.publish("t", "two").expect("publish");

        assert_eq!(subscription.recv().await, Some(Bytes::from("one")));
        assert_eq!(subscription.recv().await, Some(Bytes::from("two")));
    }

    #[test]
    fn full_subscriber_drops_without_blocking_others() {
        let bus = EventBus::with_capacity(1);
        let mut slow = bus.subscribe("t").expect("subscribe");
        let mut fast = bus.subscribe("t").expect("subscribe");

        assert_eq!(bus.publish("t", "a").expect("publish"), 2);
        assert_eq!(fast.try_recv().expect("a"), Bytes::from("a"));

        assert_eq!(bus.publish("t", "b").expect("publish"), 1);
        assert_eq!(fast.try_recv().expect("b"), Bytes::from("b"));

        assert_eq!(slow.try_recv().expect("a"), Bytes::from("a"));
        assert!(matches!(slow.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn unsubscribe_closes_only_that_channel() {
        let bus = EventBus::new();
        let mut first = bus.subscribe("t").expect("subscribe");
        let mut second = bus.subscribe("t").expect("subscribe");

        assert!(bus.unsubscribe("t", first.id()));
        assert!(!bus.unsubscribe("t", first.id()));
        bus.publish("t", "x").expect("publish");

        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, Some(Bytes::from("x")));
        assert_eq!(bus.subscriber_count("t"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_topic() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("t").expect("subscribe");
        let mut b = bus.subscribe("t").expect("subscribe");
        bus.subscribe("other").expect("subscribe");

        assert_eq!(bus.unsubscribe_all("t"), 2);
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert_eq!(bus.topics(), vec!["other".to_string()]);
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let subscription = bus.subscribe("t").expect("subscribe");
        drop(subscription);

        assert_eq!(bus.publish("t", "x").expect("publish"), 0);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn close_rejects_and_ends_streams() {
        let bus = EventBus::new();
        let mut subscription = bus.subscribe("t").expect("subscribe");

        bus.close();

        assert_eq!(subscription.recv().await, None);
        assert!(matches!(bus.publish("t", "x"), Err(PubSubError::Closed)));
        assert!(matches!(bus.subscribe("t"), Err(PubSubError::Closed)));
        bus.close();
    }

    #[test]
    fn empty_topic_is_rejected() {
        let bus = EventBus::new();
        assert!(matches!(bus.subscribe(""), Err(PubSubError::InvalidTopic)));
        assert!(matches!(bus.publish("", "x"), Err(PubSubError::InvalidTopic)));
    }
}
