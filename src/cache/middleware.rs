//! Cache-injection handler.
//!
//! Sits in a route's chain right before the route handlers. A hit writes the
//! cached body and aborts the chain; a miss runs the rest of the chain and,
//! for a non-empty 2xx body, stores a copy of it from a background task.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::keys::CacheKey;
use crate::http::{Context, Handler, handler};

pub(crate) const METRIC_CACHE_HIT: &str = "turbine_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "turbine_cache_miss_total";
pub(crate) const METRIC_CACHE_STORE: &str = "turbine_cache_store_total";
pub(crate) const METRIC_CACHE_SKIP: &str = "turbine_cache_skip_total";

/// Content type used for hits whose original response carried none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Build the cache-injection handler for one route.
///
/// `ttl` falls back to the engine's default TTL when `None`. Without a cache
/// engine on the context, or with the cache disabled, the handler only
/// forwards to the rest of the chain.
pub fn cache_injection(key: CacheKey, ttl: Option<Duration>) -> Handler {
    let key = Arc::new(key);
    handler(move |c| {
        let key = Arc::clone(&key);
        Box::pin(inject(c, key, ttl))
    })
}

#[instrument(skip_all, fields(key = %key))]
async fn inject(c: &mut Context, key: Arc<CacheKey>, ttl: Option<Duration>) {
    let Some(cache) = c.cache().ok().cloned() else {
        c.next().await;
        return;
    };
    if !cache.is_enabled() {
        c.next().await;
        return;
    }

    if let Some((body, content_type)) = cache.lookup(key.as_str()) {
        counter!(METRIC_CACHE_HIT).increment(1);
        debug!(cache = "l1", outcome = "hit", "serving cached response");
        let status = c.response_status().unwrap_or(StatusCode::OK);
        c.status(status);
        c.set_content_type(content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE));
        c.set_body(body);
        c.abort();
        return;
    }

    counter!(METRIC_CACHE_MISS).increment(1);
    debug!(cache = "l1", outcome = "miss", "cache miss, executing handler");
    c.next().await;

    let status = c.response_status().unwrap_or(StatusCode::OK);
    if !status.is_success() || c.response_body().is_empty() {
        counter!(METRIC_CACHE_SKIP).increment(1);
        debug!(
            cache = "l1",
            outcome = "skip",
            status = status.as_u16(),
            "response not cacheable"
        );
        return;
    }

    let body = Bytes::copy_from_slice(c.response_body());
    let content_type = c.content_type().map(str::to_owned);
    let ttl = ttl.unwrap_or_else(|| cache.default_ttl());
    tokio::spawn(async move {
        match cache.store_response(key.as_str(), body, content_type, ttl) {
            Ok(()) => {
                counter!(METRIC_CACHE_STORE).increment(1);
                debug!(
                    cache = "l1",
                    outcome = "store",
                    key = %key,
                    ttl_secs = ttl.as_secs(),
                    "response cached"
                );
            }
            Err(err) => warn!(key = %key, error = %err, "failed to cache response"),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::Method;
    use serde_json::json;

    use super::*;
    use crate::cache::{CacheConfig, CacheEngine};
    use crate::engine::Engines;

    fn engines(cache: &Arc<CacheEngine>) -> Engines {
        Engines {
            cache: Some(Arc::clone(cache)),
            ..Engines::default()
        }
    }

    fn counting_route(calls: &Arc<AtomicUsize>, status: StatusCode, body: &'static str) -> Handler {
        let calls = Arc::clone(calls);
        handler(move |c| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                c.status(status);
                c.set_content_type("text/plain");
                c.set_body(body);
            })
        })
    }

    async fn run(chain: &[Handler], engines: Engines) -> Context {
        let mut c = Context::new();
        c.prepare(chain.into(), engines, Arc::from("/x"));
        c.next().await;
        c
    }

    async fn wait_for(cache: &CacheEngine, key: &str) {
        for _ in 0..100 {
            if cache.exists(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{key} was never cached");
    }

    #[tokio::test]
    async fn miss_then_hit_skips_handler() {
        let cache = Arc::new(CacheEngine::in_memory());
        let key = CacheKey::for_route(&Method::GET, "/x");
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = vec![
            cache_injection(key.clone(), None),
            counting_route(&calls, StatusCode::OK, "fresh"),
        ];

        let first = run(&chain, engines(&cache)).await;
        assert_eq!(first.response_body(), b"fresh");
        wait_for(&cache, key.as_str()).await;

        for _ in 0..3 {
            let hit = run(&chain, engines(&cache)).await;
            assert!(hit.is_aborted());
            assert_eq!(hit.response_status(), Some(StatusCode::OK));
            assert_eq!(hit.response_body(), b"fresh");
            assert_eq!(hit.content_type(), Some("text/plain"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_responses_are_not_cached() {
        let cache = Arc::new(CacheEngine::in_memory());
        let key = CacheKey::for_route(&Method::GET, "/x");
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = vec![
            cache_injection(key.clone(), None),
            counting_route(&calls, StatusCode::NOT_FOUND, "missing"),
        ];

        run(&chain, engines(&cache)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        run(&chain, engines(&cache)).await;

        assert!(!cache.exists(key.as_str()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_bodies_are_not_cached() {
        let cache = Arc::new(CacheEngine::in_memory());
        let key = CacheKey::for_route(&Method::GET, "/x");
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = vec![
            cache_injection(key.clone(), None),
            counting_route(&calls, StatusCode::OK, ""),
        ];

        run(&chain, engines(&cache)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!cache.exists(key.as_str()));
    }

    #[tokio::test]
    async fn hit_preserves_status_set_upstream() {
        let cache = Arc::new(CacheEngine::in_memory());
        let key = CacheKey::for_route(&Method::GET, "/x");
        cache
            .set(key.as_str(), r#"{"n":1}"#, Duration::from_secs(60))
            .expect("seed");
        let upstream = handler(|c| {
            Box::pin(async move {
                c.status(StatusCode::ACCEPTED);
                c.next().await;
            })
        });
        let chain = vec![upstream, cache_injection(key, None)];

        let c = run(&chain, engines(&cache)).await;
        assert_eq!(c.response_status(), Some(StatusCode::ACCEPTED));
        assert_eq!(c.content_type(), Some(DEFAULT_CONTENT_TYPE));
        assert_eq!(c.response_body(), br#"{"n":1}"#);
    }

    #[tokio::test]
    async fn disabled_or_missing_cache_passes_through() {
        let disabled = Arc::new(
            CacheEngine::new(CacheConfig {
                enabled: false,
                ..Default::default()
            })
            .expect("engine"),
        );
        let key = CacheKey::for_route(&Method::GET, "/x");
        let route = handler(|c| {
            Box::pin(async move {
                c.json(StatusCode::OK, &json!({ "ok": true }));
            })
        });
        let chain = vec![cache_injection(key, None), route];

        let c = run(&chain, engines(&disabled)).await;
        assert_eq!(c.response_body(), br#"{"ok":true}"#);

        let c = run(&chain, Engines::default()).await;
        assert_eq!(c.response_body(), br#"{"ok":true}"#);
        assert!(!c.is_aborted());
    }
}
