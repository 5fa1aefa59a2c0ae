//! Snapshot-persistent variant of [`Store`].

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::log::{parent_dir, sync_dir};
use super::memory::{DEFAULT_SWEEP_INTERVAL, Entry, Store, Ttl};
use super::StoreError;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "store::persist";

pub const DEFAULT_AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(30);
const SAVE_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub data_file: PathBuf,
    /// Save shortly after every write and on a fixed interval.
    pub auto_save: bool,
    pub auto_save_interval: Duration,
    pub sweep_interval: Duration,
}

impl PersistOptions {
    pub fn new(data_file: impl Into<PathBuf>) -> Self {
        Self {
            data_file: data_file.into(),
            auto_save: false,
            auto_save_interval: DEFAULT_AUTO_SAVE_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    store: BTreeMap<String, Entry>,
}

struct Shared {
    store: Store,
    data_file: PathBuf,
    auto_save: bool,
    save_scheduled: AtomicBool,
    save_lock: Mutex<()>,
}

impl Shared {
    fn save(&self) -> Result<usize, StoreError> {
        if self.store.is_closed() {
            return Ok(0);
        }
        let _guard = mutex_lock(&self.save_lock, SOURCE, "save");

        let snapshot = Snapshot {
            store: self.store.live_entries().into_iter().collect(),
        };
        let count = snapshot.store.len();
        let encoded = serde_json::to_vec_pretty(&snapshot)?;
        write_atomically(&self.data_file, &encoded)?;

        debug!(
            target_module = SOURCE,
            path = %self.data_file.display(),
            entries = count,
            "snapshot saved"
        );
        Ok(count)
    }

    fn load(&self) -> Result<usize, StoreError> {
        let raw = match fs::read(&self.data_file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(0);
        }
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        Ok(self.store.restore(snapshot.store))
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    sync_dir(dir);
    Ok(())
}

/// [`Store`] whose live entries are snapshotted to a JSON file.
///
/// The snapshot is loaded on open (expired entries are dropped), written on
/// [`PersistentStore::save`] and [`PersistentStore::close`], and, with
/// auto-save on, shortly after each write and on a fixed interval.
pub struct PersistentStore {
    shared: Arc<Shared>,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentStore {
    pub fn open(options: PersistOptions) -> Result<Self, StoreError> {
        let shared = Arc::new(Shared {
            store: Store::with_sweep_interval(options.sweep_interval),
            data_file: options.data_file,
            auto_save: options.auto_save,
            save_scheduled: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        });

        let restored = shared.load()?;
        info!(
            target_module = SOURCE,
            path = %shared.data_file.display(),
            restored,
            "persistent store opened"
        );

        let saver = match Handle::try_current() {
            Ok(handle) if options.auto_save && !options.auto_save_interval.is_zero() => Some(
                handle.spawn(save_loop(Arc::downgrade(&shared), options.auto_save_interval)),
            ),
            _ => None,
        };

        Ok(Self {
            shared,
            saver: Mutex::new(saver),
        })
    }

    pub fn data_file(&self) -> &Path {
        &self.shared.data_file
    }

    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.shared.store.set(key, value, ttl)?;
        self.schedule_save();
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

    pub fn set_nx(
        &self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let written = self.shared.store.set_nx(key, value, ttl)?;
        if written {
            self.schedule_save();
        }
        Ok(written)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.shared.store.get(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.shared.store.exists(key)
    }

    pub fn ttl(&self, key: &str) -> Ttl {
        self.shared.store.ttl(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.shared.store.delete(key);
        if removed {
            self.schedule_save();
        }
        removed
    }

    pub fn range<F>(&self, visit: F)
    where
        F: FnMut(&str, &Bytes),
    {
        self.shared.store.range(visit);
    }

    pub fn len(&self) -> usize {
        self.shared.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store.is_empty()
    }

    /// Write the current live entries to the data file. Returns the entry count.
    pub fn save(&self) -> Result<usize, StoreError> {
        self.shared.save()
    }

    /// Merge the data file into memory, skipping expired entries.
    pub fn load(&self) -> Result<usize, StoreError> {
        self.shared.load()
    }

    /// Stop background saving, write a final snapshot, and close the store.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.shared.store.is_closed() {
            return Ok(());
        }
        if let Some(task) = mutex_lock(&self.saver, SOURCE, "close").take() {
            task.abort();
        }
        let result = self.shared.save().map(|_| ());
        self.shared.store.close();
        result
    }

    fn schedule_save(&self) {
        if !self.shared.auto_save || self.shared.save_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            self.shared.save_scheduled.store(false, Ordering::Release);
            if let Err(err) = self.shared.save() {
                log_save_failure(&self.shared.data_file, &err);
            }
            return;
        };

        let shared = Arc::downgrade(&self.shared);
        handle.spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.save_scheduled.store(false, Ordering::Release);
            let outcome = tokio::task::spawn_blocking({
                let shared = Arc::clone(&shared);
                move || shared.save()
            })
            .await;
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => log_save_failure(&shared.data_file, &err),
                Err(join) => error!(
                    target_module = SOURCE,
                    error = %join,
                    "snapshot save task failed"
                ),
            }
        });
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        if let Some(task) = mutex_lock(&self.saver, SOURCE, "drop").take() {
            task.abort();
        }
    }
}

fn log_save_failure(path: &Path, err: &StoreError) {
    error!(
        target_module = SOURCE,
        path = %path.display(),
        error = %err,
        "failed to save snapshot"
    );
}

async fn save_loop(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.store.is_closed() {
            break;
        }
        if let Err(err) = shared.save() {
            log_save_failure(&shared.data_file, &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> PersistOptions {
        PersistOptions::new(dir.path().join("data/cache.json"))
    }

    #[tokio::test]
    async fn close_then_reopen_restores_live_entries() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = PersistentStore::open(options(&dir)).expect("open");
            store.set("forever", "a", Duration::ZERO).expect("set");
            store.set("hour", "b", Duration::from_secs(3600)).expect("set");
            store.close().expect("close");
        }

        let store = PersistentStore::open(options(&dir)).expect("reopen");
        assert_eq!(store.get("forever"), Some(Bytes::from("a")));
        assert_eq!(store.get("hour"), Some(Bytes::from("b")));
        assert_eq!(store.ttl("forever"), Ttl::Infinite);
        assert!(matches!(store.ttl("hour"), Ttl::Remaining(_)));
    }

    #[tokio::test]
    async fn expired_entries_are_not_restored() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = PersistentStore::open(options(&dir)).expect("open");
            store.set("short", "x", Duration::from_millis(30)).expect("set");
            store.save().expect("save");
            store.close().expect("close");
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let store = PersistentStore::open(options(&dir)).expect("reopen");
        assert_eq!(store.get("short"), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = TempDir::new().expect("tempdir");
        let store = PersistentStore::open(options(&dir)).expect("open");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn malformed_snapshot_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let opts = options(&dir);
        fs::create_dir_all(opts.data_file.parent().expect("parent")).expect("mkdir");
        fs::write(&opts.data_file, "{not json").expect("write");

        let err = PersistentStore::open(opts).err().expect("decode error");
        assert!(matches!(err, StoreError::Json(_)));
    }

    #[tokio::test]
    async fn auto_save_writes_after_set() {
        let dir = TempDir::new().expect("tempdir");
        let store = PersistentStore::open(options(&dir).auto_save(true)).expect("open");
        store.set("k", "v", Duration::ZERO).expect("set");

        tokio::time::sleep(Duration::from_millis(400)).await;

        let raw = fs::read_to_string(store.data_file()).expect("snapshot written");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(json["store"]["k"]["value"], "dg==");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_writes() {
        let dir = TempDir::new().expect("tempdir");
        let store = PersistentStore::open(options(&dir)).expect("open");
        store.set("k", "v", Duration::ZERO).expect("set");

        store.close().expect("close");
        store.close().expect("second close");

        assert!(matches!(store.set("k", "v", Duration::ZERO), Err(StoreError::Closed)));

        let reopened = PersistentStore::open(options(&dir)).expect("reopen");
        assert_eq!(reopened.get("k"), Some(Bytes::from("v")));
    }
}
