//! Turbine: an onion-model handler chain hosted on axum, with a TTL response
//! cache and in-memory or log-backed pub/sub and task queues.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod infra;
pub mod pubsub;
pub mod queue;
pub mod store;
pub mod util;

pub use engine::{Engines, PubSubEngine, QueueEngine};
pub use error::AppError;
pub use http::{App, Context, Group, Handler, Route, RouteRegistrar, handler};
