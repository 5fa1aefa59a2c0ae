//! Response cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::store::{DEFAULT_AUTO_SAVE_INTERVAL, DEFAULT_SWEEP_INTERVAL, PersistOptions};

/// Default lifetime of a cached response when the route sets none.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_DATA_FILE: &str = "data/cache.json";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; when off, lookups miss and writes are refused.
    pub enabled: bool,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    /// Snapshot entries to `data_file` instead of keeping them only in memory.
    pub persist: bool,
    pub data_file: PathBuf,
    pub auto_save: bool,
    pub auto_save_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: DEFAULT_CACHE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            persist: false,
            data_file: PathBuf::from(DEFAULT_DATA_FILE),
            auto_save: false,
            auto_save_interval: DEFAULT_AUTO_SAVE_INTERVAL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            default_ttl: settings.default_ttl,
            sweep_interval: settings.sweep_interval,
            persist: settings.persist,
            data_file: settings.data_file.clone(),
            auto_save: settings.auto_save,
            auto_save_interval: settings.auto_save_interval,
        }
    }
}

impl CacheConfig {
    pub(crate) fn persist_options(&self) -> PersistOptions {
        PersistOptions {
            data_file: self.data_file.clone(),
            auto_save: self.auto_save,
            auto_save_interval: self.auto_save_interval,
            sweep_interval: self.sweep_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert!(!config.persist);
        assert!(!config.auto_save);
        assert_eq!(config.auto_save_interval, Duration::from_secs(30));
    }

    #[test]
    fn persist_options_follow_config() {
        let config = CacheConfig {
            data_file: PathBuf::from("/tmp/snap.json"),
            auto_save: true,
            ..Default::default()
        };
        let options = config.persist_options();
        assert_eq!(options.data_file, PathBuf::from("/tmp/snap.json"));
        assert!(options.auto_save);
    }
}
