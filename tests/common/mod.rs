#![allow(dead_code)]

use pagedtree::{CacheConfig, PageCache};
use tempfile::TempDir;

use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
}

pub fn config(dir: &TempDir, capacity: usize, page_size: usize) -> CacheConfig {
    CacheConfig::new(dir.path())
        .with_capacity(capacity)
        .with_page_size(page_size)
}

pub fn temp_cache(capacity: usize, page_size: usize) -> (TempDir, Arc<PageCache>) {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cache = PageCache::new(config(&dir, capacity, page_size)).unwrap();
    (dir, Arc::new(cache))
}

/// Opens a second cache over a directory some earlier cache wrote to.
pub fn reopen(dir: &TempDir, capacity: usize, page_size: usize) -> Arc<PageCache> {
    Arc::new(PageCache::new(config(dir, capacity, page_size)).unwrap())
}
