//! Topic-based publish/subscribe.
//!
//! [`EventBus`] fans each message out to every current subscriber of a topic
//! through bounded channels; a full subscriber loses that message instead of
//! slowing the publisher. [`DurableEventBus`] appends every message to a log
//! first, so history can be inspected, replayed and compacted.

mod bus;
mod durable;

use thiserror::Error;

use crate::store::LogError;

pub use bus::{DEFAULT_SUBSCRIBER_CAPACITY, EventBus, Subscription, SubscriptionId};
pub use durable::{DurableBusOptions, DurableEventBus, Message};

pub(crate) use bus::METRIC_PUBSUB_DROPPED;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("event bus is closed")]
    Closed,
    #[error("topic name must not be empty")]
    InvalidTopic,
    #[error(transparent)]
    Log(#[from] LogError),
}
