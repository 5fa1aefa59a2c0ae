//! Response cache keys.

use std::fmt;

use axum::http::Method;

/// Slot for one route's cached response: `cache:{METHOD}:{route path}`.
///
/// Built from the registered route pattern, never from the concrete request
/// path, query, headers or body, so every request to a route shares a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_route(method: &Method, route_path: &str) -> Self {
        Self(format!("cache:{}:{}", method.as_str(), route_path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_combines_method_and_route_pattern() {
        let key = CacheKey::for_route(&Method::GET, "/users/:id");
        assert_eq!(key.as_str(), "cache:GET:/users/:id");
        assert_eq!(key.to_string(), "cache:GET:/users/:id");
    }

    #[test]
    fn methods_get_distinct_slots() {
        assert_ne!(
            CacheKey::for_route(&Method::GET, "/x"),
            CacheKey::for_route(&Method::POST, "/x")
        );
    }
}
