use std::sync::atomic::{AtomicU32, Ordering};

use crate::bufmgr::PageCache;
use crate::error::Result;
use crate::ids::PageId;

/// Hands out page ids within one segment, pages are numbered from zero and never reused.
#[derive(Debug)]
pub struct Segment {
    id: u16,
    page_count: AtomicU32
}

impl Segment {
    /// A segment with no pages yet.
    pub fn new(id: u16) -> Segment {
        Segment::with_page_count(id, 0)
    }

    pub fn with_page_count(id: u16, page_count: u32) -> Segment {
        Segment {
            id,
            page_count: AtomicU32::new(page_count)
        }
    }

    /// Reopens a segment, counting the pages its file already holds.
    pub fn open(cache: &PageCache, id: u16) -> Result<Segment> {
        Ok(Segment::with_page_count(id, cache.pages_on_disk(id)?))
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::Acquire)
    }

    /// Reserves the next page of the segment.
    pub fn add_page(&self) -> PageId {
        let page = self.page_count.fetch_add(1, Ordering::AcqRel);
        PageId::new(self.id, page)
    }

    /// Id of page `n`, whether or not it was allocated yet.
    #[inline]
    pub fn page(&self, n: u32) -> PageId {
        PageId::new(self.id, n)
    }

    #[inline]
    pub fn contains(&self, pid: PageId) -> bool {
        pid.segment() == self.id && pid.page() < self.page_count()
    }
}
