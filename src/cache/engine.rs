use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use super::CacheError;
use super::config::CacheConfig;
use crate::store::{PersistentStore, Store, Ttl};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::engine";

enum Backend {
    Memory(Store),
    Persistent(PersistentStore),
}

/// Response cache over a [`Store`] or, when configured, a [`PersistentStore`].
pub struct CacheEngine {
    backend: Backend,
    config: CacheConfig,
    content_types: RwLock<HashMap<String, String>>,
}

impl CacheEngine {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let backend = if config.persist {
            Backend::Persistent(PersistentStore::open(config.persist_options())?)
        } else {
            Backend::Memory(Store::with_sweep_interval(config.sweep_interval))
        };
        info!(
            enabled = config.enabled,
            persist = config.persist,
            default_ttl_secs = config.default_ttl.as_secs(),
            "response cache ready"
        );
        Ok(Self {
            backend,
            config,
            content_types: RwLock::new(HashMap::new()),
        })
    }

    /// In-memory cache with default settings.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Store::new()),
            config: CacheConfig::default(),
            content_types: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        if !self.config.enabled {
            return None;
        }
        match &self.backend {
            Backend::Memory(store) => store.get(key),
            Backend::Persistent(store) => store.get(key),
        }
    }

    /// Store `value` under `key`. A zero `ttl` never expires.
    pub fn set(&self, key: &str, value: impl Into<Bytes>, ttl: Duration) -> Result<(), CacheError> {
        if !self.config.enabled {
            return Err(CacheError::Disabled);
        }
        match &self.backend {
            Backend::Memory(store) => store.set(key, value, ttl)?,
            Backend::Persistent(store) => store.set(key, value, ttl)?,
        }
        Ok(())
    }

    pub fn ttl(&self, key: &str) -> Ttl {
        match &self.backend {
            Backend::Memory(store) => store.ttl(key),
            Backend::Persistent(store) => store.ttl(key),
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn delete(&self, key: &str) -> bool {
        rw_write(&self.content_types, SOURCE, "delete").remove(key);
        match &self.backend {
            Backend::Memory(store) => store.delete(key),
            Backend::Persistent(store) => store.delete(key),
        }
    }

    /// Visit a snapshot of the live entries.
    pub fn range<F>(&self, visit: F)
    where
        F: FnMut(&str, &Bytes),
    {
        match &self.backend {
            Backend::Memory(store) => store.range(visit),
            Backend::Persistent(store) => store.range(visit),
        }
    }

    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Memory(store) => store.len(),
            Backend::Persistent(store) => store.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a captured response body together with its content type.
    ///
    /// The content-type lock is held across the body write, so a
    /// [`CacheEngine::lookup`] never pairs a new body with a stale type.
    pub fn store_response(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<String>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut types = rw_write(&self.content_types, SOURCE, "store_response");
        self.set(key, body, ttl)?;
        match content_type {
            Some(content_type) => types.insert(key.to_string(), content_type),
            None => types.remove(key),
        };
        Ok(())
    }

    /// A cached body and the content type stored with it, read together.
    pub fn lookup(&self, key: &str) -> Option<(Bytes, Option<String>)> {
        let types = rw_read(&self.content_types, SOURCE, "lookup");
        let body = self.get(key)?;
        Some((body, types.get(key).cloned()))
    }

    /// Content type recorded with the last response stored under `key`.
    pub fn content_type(&self, key: &str) -> Option<String> {
        rw_read(&self.content_types, SOURCE, "content_type")
            .get(key)
            .cloned()
    }

    /// Release the backing store; a persistent backend writes a final snapshot.
    pub fn close(&self) -> Result<(), CacheError> {
        rw_write(&self.content_types, SOURCE, "close").clear();
        match &self.backend {
            Backend::Memory(store) => store.close(),
            Backend::Persistent(store) => store.close()?,
        }
        Ok(())
    }
}
