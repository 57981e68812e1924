use thiserror::Error;

use std::path::PathBuf;

use crate::ids::PageId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("segment file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no evictable frame left in a pool of {capacity} frames")]
    OutOfFrames { capacity: usize },
    #[error("page {0} is already fixed by the current thread")]
    AlreadyLocked(PageId),
    #[error("node invariant violated: {0}")]
    NodeInvariant(String),
    #[error("record of {size} bytes exceeds the page capacity of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to load configuration from {path:?}")]
    Config {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>
    }
}

pub type Result<T> = std::result::Result<T, Error>;
