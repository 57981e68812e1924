//! Page and tuple identifiers.
//!
//! Both identifiers are plain `u64`s so they can be stored verbatim inside pages:
//!
//! ```text
//!  63        48 47                       16 15          0
//! +-----------+---------------------------+-------------+
//! |  segment  |           page            |    tuple    |
//! +-----------+---------------------------+-------------+
//! ```
//!
//! A [`PageId`] always has the tuple bits cleared, a [`TupleId`] projects to the page it lives in
//! through [`TupleId::page_id`].

use std::fmt;

const SEGMENT_SHIFT: u32 = 48;
const PAGE_SHIFT: u32 = 16;
const PAGE_MASK: u64 = 0x0000_ffff_ffff_0000;
const TUPLE_MASK: u64 = 0x0000_0000_0000_ffff;

/// Identifies one fixed-size page within one segment.
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Copy, Clone)]
#[repr(transparent)]
pub struct PageId(u64);

impl PageId {
    /// Reserved value meaning "no page", used for the end of the leaf chain.
    pub const INVALID: PageId = PageId(u64::MAX);

    #[inline]
    pub fn new(segment: u16, page: u32) -> PageId {
        PageId(((segment as u64) << SEGMENT_SHIFT) | ((page as u64) << PAGE_SHIFT))
    }

    /// Rebuilds a page id from its raw representation, dropping any tuple bits.
    #[inline]
    pub fn from_raw(raw: u64) -> PageId {
        if raw == u64::MAX {
            PageId::INVALID
        } else {
            PageId(raw & !TUPLE_MASK)
        }
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn segment(&self) -> u16 {
        (self.0 >> SEGMENT_SHIFT) as u16
    }

    #[inline]
    pub fn page(&self) -> u32 {
        ((self.0 & PAGE_MASK) >> PAGE_SHIFT) as u32
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != PageId::INVALID
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.debug_tuple("PageId")
                .field(&self.segment())
                .field(&self.page())
                .finish()
        } else {
            f.write_str("PageId(INVALID)")
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment(), self.page())
    }
}

/// Identifies one record slot within one page of one segment.
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Copy, Clone)]
#[repr(transparent)]
pub struct TupleId(u64);

impl TupleId {
    #[inline]
    pub fn new(segment: u16, page: u32, tuple: u16) -> TupleId {
        TupleId(PageId::new(segment, page).0 | tuple as u64)
    }

    #[inline]
    pub fn from_raw(raw: u64) -> TupleId {
        TupleId(raw)
    }

    /// Builds the tuple id of slot `tuple` inside `pid`.
    #[inline]
    pub fn from_page(pid: PageId, tuple: u16) -> TupleId {
        TupleId(pid.0 | tuple as u64)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn segment(&self) -> u16 {
        (self.0 >> SEGMENT_SHIFT) as u16
    }

    #[inline]
    pub fn page(&self) -> u32 {
        ((self.0 & PAGE_MASK) >> PAGE_SHIFT) as u32
    }

    #[inline]
    pub fn tuple(&self) -> u16 {
        (self.0 & TUPLE_MASK) as u16
    }

    /// Projects this tuple id onto the page holding it.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId(self.0 & !TUPLE_MASK)
    }

    /// Compares only the segment and page portion, ignoring the tuple bits.
    #[inline]
    pub fn same_page(&self, other: &TupleId) -> bool {
        self.page_id() == other.page_id()
    }
}

impl From<PageId> for TupleId {
    fn from(pid: PageId) -> TupleId {
        TupleId(pid.0)
    }
}

impl fmt::Debug for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TupleId")
            .field(&self.segment())
            .field(&self.page())
            .field(&self.tuple())
            .finish()
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.segment(), self.page(), self.tuple())
    }
}
