use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default page size: eight 4 KiB blocks.
pub const DEFAULT_PAGE_SIZE: usize = 8 * 4096;

/// Default number of frames held by a page cache.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default share of the capacity the cold queue may hold before it becomes the preferred source
/// of eviction victims.
pub const DEFAULT_COLD_QUEUE_THRESHOLD: f64 = 0.66;

/// Parameters of a [`PageCache`](crate::bufmgr::PageCache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one file per segment.
    pub data_dir: PathBuf,
    /// Number of frames, the upper bound of resident pages.
    pub capacity: usize,
    /// Bytes per page.
    pub page_size: usize,
    pub cold_queue_threshold: f64,
    /// How many times eviction retries the victim's bucket latch before moving on.
    pub eviction_retries: u32,
    pub eviction_backoff_micros: u64
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            data_dir: PathBuf::from("data"),
            capacity: DEFAULT_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            cold_queue_threshold: DEFAULT_COLD_QUEUE_THRESHOLD,
            eviction_retries: 8,
            eviction_backoff_micros: 50
        }
    }
}

impl CacheConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        CacheConfig {
            data_dir: data_dir.into(),
            ..CacheConfig::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cold_queue_threshold(mut self, threshold: f64) -> Self {
        self.cold_queue_threshold = threshold;
        self
    }

    pub fn with_eviction_retries(mut self, retries: u32) -> Self {
        self.eviction_retries = retries;
        self
    }

    pub fn with_eviction_backoff(mut self, backoff: Duration) -> Self {
        self.eviction_backoff_micros = backoff.as_micros() as u64;
        self
    }

    pub fn eviction_backoff(&self) -> Duration {
        Duration::from_micros(self.eviction_backoff_micros)
    }

    /// Number of frames the cold queue may hold before eviction prefers it.
    pub fn cold_queue_limit(&self) -> usize {
        (self.cold_queue_threshold * self.capacity as f64) as usize
    }

    /// Reads a JSON configuration file, fields that are missing take their default value.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let text = std::fs::read_to_string(&path).map_err(|e| Error::Config {
            path: path.clone(),
            source: Box::new(e)
        })?;

        let config: CacheConfig = serde_json::from_str(&text).map_err(|e| Error::Config {
            path: path.clone(),
            source: Box::new(e)
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("data_dir must not be empty".to_string()));
        }

        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be at least one frame".to_string()));
        }

        // Pages are addressed by u32 page numbers and offsets are computed in u64
        if self.page_size < 512 || self.page_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!("page_size {} out of range", self.page_size)));
        }

        if !(self.cold_queue_threshold > 0.0 && self.cold_queue_threshold < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "cold_queue_threshold must be in (0, 1), got {}",
                self.cold_queue_threshold
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CacheConfig;
    use crate::error::Error;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        assert_eq!(config.page_size, 8 * 4096);
        assert_eq!(config.capacity, 1024);
        assert!(config.validate().is_ok());
        assert_eq!(config.cold_queue_limit(), 675);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let base = CacheConfig::new("somewhere");
        assert!(matches!(base.clone().with_capacity(0).validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(base.clone().with_page_size(16).validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(base.clone().with_cold_queue_threshold(1.0).validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(base.clone().with_cold_queue_threshold(0.0).validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(CacheConfig::new("").validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn loads_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{ "data_dir": "/tmp/pages", "capacity": 16 }}"#).unwrap();
        drop(file);

        let config = CacheConfig::load_from_file(&path).unwrap();
        assert_eq!(config.capacity, 16);
        assert_eq!(config.page_size, super::DEFAULT_PAGE_SIZE);
        assert_eq!(config.data_dir, std::path::PathBuf::from("/tmp/pages"));
    }

    #[test]
    fn json_round_trip() {
        let config = CacheConfig::new("/var/lib/pages")
            .with_capacity(64)
            .with_page_size(4096)
            .with_cold_queue_threshold(0.5);
        let text = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn load_reports_path_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        match CacheConfig::load_from_file(&missing) {
            Err(Error::Config { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected result {:?}", other)
        }

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ capacity: ").unwrap();
        assert!(matches!(CacheConfig::load_from_file(&broken), Err(Error::Config { .. })));

        let invalid = dir.path().join("invalid.json");
        std::fs::write(&invalid, r#"{ "capacity": 0 }"#).unwrap();
        assert!(matches!(CacheConfig::load_from_file(&invalid), Err(Error::InvalidConfig(_))));
    }
}
