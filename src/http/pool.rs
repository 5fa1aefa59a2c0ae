use std::sync::Mutex;

use super::Context;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "http::pool";

pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Free list of request contexts.
///
/// Contexts are reset on the way out and on the way back in. At most
/// `capacity` idle contexts are kept; extras are dropped on release.
pub struct ContextPool {
    idle: Mutex<Vec<Context>>,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn acquire(&self) -> Context {
        let pooled = mutex_lock(&self.idle, SOURCE, "acquire").pop();
        let mut context = pooled.unwrap_or_default();
        context.reset();
        context
    }

    pub fn release(&self, mut context: Context) {
        context.reset();
        let mut idle = mutex_lock(&self.idle, SOURCE, "release");
        if idle.len() < self.capacity {
            idle.push(context);
        }
    }

    /// Number of contexts waiting for reuse.
    pub fn idle(&self) -> usize {
        mutex_lock(&self.idle, SOURCE, "idle").len()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::*;

    #[test]
    fn released_contexts_come_back_clean() {
        let pool = ContextPool::new(4);
        let mut context = pool.acquire();
        context.set_param("id", "1");
        context.set_session("user", "ada");
        context.text(StatusCode::CREATED, "body");
        pool.release(context);
        assert_eq!(pool.idle(), 1);

        let context = pool.acquire();
        assert_eq!(pool.idle(), 0);
        assert!(context.params().is_empty());
        assert!(context.session("user").is_none());
        assert!(context.response_status().is_none());
        assert!(context.response_body().is_empty());
    }

    #[test]
    fn pool_keeps_at_most_capacity() {
        let pool = ContextPool::new(1);
        let first = pool.acquire();
        let second = pool.acquire();
        pool.release(first);
        pool.release(second);
        assert_eq!(pool.idle(), 1);
    }
}
