use env_logger::Builder;
use serde::Deserialize;
use tempfile::TempDir;

use std::io::Write;
use std::sync::Arc;

use crate::btree::{BTree, NaturalOrder};
use crate::bufmgr::PageCache;
use crate::config::CacheConfig;
use crate::ids::TupleId;
use crate::segment::Segment;

/// Routes `log` output through `env_logger`, filtered by `RUST_LOG`. Safe to call from every test.
pub fn init_logging() {
    let mut builder = Builder::from_default_env();
    let _ = builder
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{:?}] [{}:{}] {}",
                record.level(),
                std::thread::current().id(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .is_test(true)
        .try_init();
}

/// A cache over a fresh temporary directory, which is removed when the returned `TempDir` drops.
pub fn temp_cache(capacity: usize, page_size: usize) -> (TempDir, Arc<PageCache>) {
    init_logging();
    let dir = tempfile::tempdir().expect("temporary directory");
    let config = CacheConfig::new(dir.path())
        .with_capacity(capacity)
        .with_page_size(page_size);
    let cache = PageCache::new(config).expect("valid cache config");
    (dir, Arc::new(cache))
}

#[derive(Deserialize, Debug)]
struct SampleTree {
    max_entries: Option<usize>,
    keys: Vec<u64>,
    #[serde(default)]
    erased: Vec<u64>
}

/// Builds a tree from a JSON fixture listing the keys to insert (in order) and erase.
/// Each key maps to the tuple id with page number `key`.
pub fn sample_tree<P: AsRef<std::path::Path>>(path: P) -> (TempDir, BTree<u64>) {
    let text = std::fs::read_to_string(path).expect("fixture exists");
    let sample: SampleTree = serde_json::from_str(&text).expect("fixture is valid");

    let (dir, cache) = temp_cache(64, 1024);
    let tree = BTree::create_with(cache, Segment::new(1), sample.max_entries, NaturalOrder).expect("tree");
    for key in sample.keys.iter() {
        tree.insert(*key, TupleId::new(1, *key as u32, 0)).expect("insert");
    }
    for key in sample.erased.iter() {
        tree.erase(key).expect("erase");
    }

    (dir, tree)
}
