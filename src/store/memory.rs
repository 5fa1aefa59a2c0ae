//! In-memory key/value store with expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::StoreError;
use crate::util::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "store::memory";

/// How often expired entries are physically removed.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A stored value and its absolute expiry (`None` never expires).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(with = "crate::util::bytes")]
    pub value: Bytes,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl Entry {
    /// Build an entry that expires `ttl` from `now`; a zero `ttl` never expires.
    pub fn new(value: Bytes, ttl: Duration, now: OffsetDateTime) -> Self {
        Self {
            value,
            expires_at: expiry_after(now, ttl),
        }
    }

    pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }

    fn ttl_at(&self, now: OffsetDateTime) -> Ttl {
        match self.expires_at {
            None => Ttl::Infinite,
            Some(at) => {
                let remaining = at - now;
                if remaining.is_positive() {
                    Ttl::Remaining(remaining.unsigned_abs())
                } else {
                    Ttl::NotFound
                }
            }
        }
    }
}

fn expiry_after(now: OffsetDateTime, ttl: Duration) -> Option<OffsetDateTime> {
    if ttl.is_zero() {
        return None;
    }
    time::Duration::try_from(ttl)
        .ok()
        .and_then(|ttl| now.checked_add(ttl))
}

/// Result of a [`Store::ttl`] lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key is absent or already expired.
    NotFound,
    /// Key exists without an expiry.
    Infinite,
    /// Key expires after the contained duration.
    Remaining(Duration),
}

impl Ttl {
    /// Redis-style integer form: `-2` absent, `-1` no expiry, else whole seconds left.
    pub fn as_seconds(self) -> i64 {
        match self {
            Ttl::NotFound => -2,
            Ttl::Infinite => -1,
            Ttl::Remaining(left) => i64::try_from(left.as_secs()).unwrap_or(i64::MAX),
        }
    }
}

struct Shared {
    entries: RwLock<HashMap<String, Entry>>,
    closed: AtomicBool,
}

impl Shared {
    fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "purge_expired");
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live_at(now));
        before - entries.len()
    }
}

/// Key/value store where every entry may carry an absolute expiry.
///
/// Expired entries behave as absent from the moment they expire; the sweep
/// task only reclaims their memory. The sweep runs when the store is created
/// inside a tokio runtime and stops on [`Store::close`] or drop.
pub struct Store {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(period: Duration) -> Self {
        let shared = Arc::new(Shared {
            entries: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !period.is_zero() => {
                Some(handle.spawn(sweep_loop(Arc::downgrade(&shared), period)))
            }
            _ => {
                debug!(
                    target_module = SOURCE,
                    "no runtime available; expired entries are only dropped lazily"
                );
                None
            }
        };

        Self {
            shared,
            sweeper: Mutex::new(sweeper),
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Insert or overwrite `key`. A zero `ttl` never expires.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let entry = Entry::new(value.into(), ttl, OffsetDateTime::now_utc());
        rw_write(&self.shared.entries, SOURCE, "set").insert(key.into(), entry);
        Ok(())
    }

    pub fn set_ex(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        seconds: u64,
    ) -> Result<(), StoreError> {
        self.set(key, value, Duration::from_secs(seconds))
    }

    /// Insert only if no live entry exists. Returns whether the write happened.
    pub fn set_nx(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let key = key.into();
        let now = OffsetDateTime::now_utc();
        let mut entries = rw_write(&self.shared.entries, SOURCE, "set_nx");
        if entries.get(&key).is_some_and(|entry| entry.is_live_at(now)) {
            return Ok(false);
        }
        entries.insert(key, Entry::new(value.into(), ttl, now));
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = OffsetDateTime::now_utc();
        rw_read(&self.shared.entries, SOURCE, "get")
            .get(key)
            .filter(|entry| entry.is_live_at(now))
            .map(|entry| entry.value.clone())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn ttl(&self, key: &str) -> Ttl {
        let now = OffsetDateTime::now_utc();
        rw_read(&self.shared.entries, SOURCE, "ttl")
            .get(key)
            .map_or(Ttl::NotFound, |entry| entry.ttl_at(now))
    }

    /// Remove `key`, returning whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        rw_write(&self.shared.entries, SOURCE, "delete")
            .remove(key)
            .is_some()
    }

    /// Visit a point-in-time copy of the live entries.
    ///
    /// The lock is released before `visit` runs, so callers may touch the
    /// store from inside the callback.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &Bytes),
    {
        for (key, entry) in self.live_entries() {
            visit(&key, &entry.value);
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        rw_read(&self.shared.entries, SOURCE, "len")
            .values()
            .filter(|entry| entry.is_live_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically drop expired entries now, returning how many were removed.
    pub fn sweep(&self) -> usize {
        self.shared.purge_expired(OffsetDateTime::now_utc())
    }

    /// Stop the sweep and release every entry. Later writes fail with
    /// [`StoreError::Closed`]; reads report absence.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(task) = mutex_lock(&self.sweeper, SOURCE, "close").take() {
            task.abort();
        }
        rw_write(&self.shared.entries, SOURCE, "close").clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn live_entries(&self) -> Vec<(String, Entry)> {
        let now = OffsetDateTime::now_utc();
        rw_read(&self.shared.entries, SOURCE, "live_entries")
            .iter()
            .filter(|(_, entry)| entry.is_live_at(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Insert entries recovered from disk, skipping the ones already expired.
    pub(crate) fn restore<I>(&self, recovered: I) -> usize
    where
        I: IntoIterator<Item = (String, Entry)>,
    {
        let now = OffsetDateTime::now_utc();
        let mut entries = rw_write(&self.shared.entries, SOURCE, "restore");
        let mut restored = 0;
        for (key, entry) in recovered {
            if entry.is_live_at(now) {
                entries.insert(key, entry);
                restored += 1;
            }
        }
        restored
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(task) = mutex_lock(&self.sweeper, SOURCE, "drop").take() {
            task.abort();
        }
    }
}

async fn sweep_loop(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        let removed = shared.purge_expired(OffsetDateTime::now_utc());
        if removed > 0 {
            debug!(target_module = SOURCE, removed, "swept expired entries");
        }
    }
}
