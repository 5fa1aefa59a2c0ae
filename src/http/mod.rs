//! HTTP layer: request contexts, handler chains and routing onto axum.
//!
//! Handlers are plain async closures over a [`Context`]. An [`App`] collects
//! routes, possibly through nested [`Group`]s, and [`App::into_router`] turns
//! them into an `axum::Router` whose endpoints run the frozen chains.

mod app;
mod context;
pub mod middleware;
mod pool;
mod route;
mod transport;

use thiserror::Error;

pub use app::{App, DEFAULT_BODY_LIMIT};
pub use context::{Context, Handler, handler};
pub use pool::{ContextPool, DEFAULT_POOL_CAPACITY};
pub use route::{ALL_METHODS, CacheOptions, Group, Route, RouteRegistrar};

pub(crate) use middleware::METRIC_HTTP_REQUEST_MS;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{0} engine is not configured")]
    EngineMissing(&'static str),
}
