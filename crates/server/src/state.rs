//! Application state shared across handlers.

use crate::tracker::RegistryTracker;
use depot_cache::{AtomicWriter, DiskCache};
use depot_core::config::AppConfig;
use depot_fetch::FetchCoordinator;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// On-disk LRU cache.
    pub cache: Arc<DiskCache>,
    /// Deduplicating fetch coordinator.
    pub coordinator: Arc<FetchCoordinator>,
    /// Registry tracker.
    pub tracker: Arc<RegistryTracker>,
}

impl AppState {
    /// Build the full component graph from configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid; `validate()` it first for a
    /// graceful error.
    pub fn from_config(config: AppConfig) -> depot_cache::CacheResult<Self> {
        if let Err(error) = config.validate() {
            panic!("invalid configuration: {error}");
        }

        let cache = Arc::new(DiskCache::new(
            config.cache.cache_dir(),
            config.cache.size_limit_bytes,
        )?);
        let writer = AtomicWriter::new(config.cache.temp_dir())?;
        std::fs::create_dir_all(config.cache.static_dir())?;

        let client = reqwest::Client::new();
        let coordinator = Arc::new(FetchCoordinator::new(
            Arc::clone(&cache),
            writer,
            client.clone(),
            config.upstream.probe_timeout(),
            config.upstream.probe_retries,
        ));

        let tracker = Arc::new(RegistryTracker::new(
            client,
            Arc::clone(&cache),
            Arc::clone(&coordinator),
            &config,
        ));

        Ok(Self {
            config: Arc::new(config),
            cache,
            coordinator,
            tracker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn from_config_creates_directories() {
        let temp = tempfile::tempdir().unwrap();
        let config = AppConfig::for_testing(
            temp.path().to_path_buf(),
            vec!["http://storage-1:8080".to_string()],
        );

        let state = AppState::from_config(config).unwrap();
        assert!(state.config.cache.cache_dir().is_dir());
        assert!(state.config.cache.temp_dir().is_dir());
        assert!(state.config.cache.static_dir().is_dir());
        assert_eq!(state.cache.entry_count(), 0);
    }

    #[test]
    #[should_panic(expected = "invalid configuration")]
    fn from_config_rejects_invalid_config() {
        let config = AppConfig::for_testing(PathBuf::from("/tmp/depot-invalid"), Vec::new());
        let _ = AppState::from_config(config);
    }
}
