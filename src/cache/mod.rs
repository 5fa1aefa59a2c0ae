//! Turbine response cache.
//!
//! - [`CacheEngine`]: key/value response cache backed by the expiring
//!   [`Store`](crate::store::Store), or by a
//!   [`PersistentStore`](crate::store::PersistentStore) when `persist` is set.
//! - [`cache_injection`]: handler inserted in front of cacheable routes. It
//!   serves hits without running the route and stores successful responses
//!   in the background.
//!
//! Keys are derived from the HTTP method and the route pattern only, so
//! every request to one route shares one slot:
//!
//! ```toml
//! [cache]
//! enabled = true
//! default_ttl_seconds = 300
//! persist = false
//! ```

mod config;
mod engine;
mod keys;
mod middleware;

use thiserror::Error;

use crate::store::StoreError;

pub use config::{CacheConfig, DEFAULT_CACHE_TTL};
pub use engine::CacheEngine;
pub use keys::CacheKey;
pub use middleware::{DEFAULT_CONTENT_TYPE, cache_injection};

pub(crate) use middleware::{
    METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_SKIP, METRIC_CACHE_STORE,
};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("response cache is disabled")]
    Disabled,
    #[error(transparent)]
    Store(#[from] StoreError),
}
