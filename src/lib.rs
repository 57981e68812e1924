//! A small disk-backed storage engine.
//!
//! [`bufmgr::PageCache`] keeps a fixed number of pages of the segment files in memory and picks
//! eviction victims with a 2Q policy. On top of it, [`btree::BTree`] indexes fixed-width keys to
//! [`TupleId`]s with latch coupling, and [`record::SpSegment`] stores the variable-length records
//! those ids point to in slotted pages.
//!
//! ```no_run
//! use pagedtree::{BTree, CacheConfig, PageCache, Segment, SpSegment};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(PageCache::new(CacheConfig::new("data").with_capacity(256))?);
//! let records = SpSegment::new(cache.clone(), Segment::new(1))?;
//! let index: BTree<u64> = BTree::create(cache, Segment::new(2))?;
//!
//! let tid = records.insert(b"hello")?;
//! index.insert(7, tid)?;
//! assert_eq!(records.lookup(index.lookup(&7)?.unwrap())?, Some(b"hello".to_vec()));
//! # Ok::<(), pagedtree::Error>(())
//! ```

pub mod btree;
pub mod bufmgr;
pub mod config;
pub mod error;
pub mod ids;
pub mod latch;
pub mod list;
pub mod record;
pub mod segment;
#[cfg(test)]
pub(crate) mod util;

pub use btree::{BTree, Comparator, NaturalOrder, NodeKey};
pub use bufmgr::{CacheStats, PageCache, PageGuard, QueueKind};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use ids::{PageId, TupleId};
pub use record::SpSegment;
pub use segment::Segment;
