use smallvec::SmallVec;

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::error::Result;
use crate::ids::PageId;
use crate::latch::{ExclusiveGuard, Latch, SharedGuard};
use crate::list::{Adapter, Links, NIL};

use super::files::SegmentFiles;

/// The replacement queue a resident frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// First-time accesses, FIFO.
    Cold,
    /// Re-accessed pages, LRU.
    Hot
}

thread_local! {
    /// Frames the current thread holds a [`PageGuard`] on, in either mode.
    static FIXED_FRAMES: RefCell<SmallVec<[usize; 8]>> = RefCell::new(SmallVec::new());
}

#[inline]
fn frame_key(latch: &Latch<PageFrame>) -> usize {
    latch as *const Latch<PageFrame> as usize
}

const TAG_NONE: u8 = 0;
const TAG_COLD: u8 = 1;
const TAG_HOT: u8 = 2;

/// One page worth of memory and the identity of the page it currently holds.
pub struct PageFrame {
    pid: PageId,
    data: Box<[u8]>,
    dirty: AtomicBool
}

impl PageFrame {
    pub(crate) fn new(page_size: usize) -> PageFrame {
        PageFrame {
            pid: PageId::INVALID,
            data: vec![0u8; page_size].into_boxed_slice(),
            dirty: AtomicBool::new(false)
        }
    }

    #[inline]
    pub fn pid(&self) -> PageId {
        self.pid
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release)
    }

    #[inline]
    fn offset(&self) -> u64 {
        self.pid.page() as u64 * self.data.len() as u64
    }

    pub(crate) fn assign(&mut self, pid: PageId) {
        self.pid = pid;
        self.dirty.store(false, Ordering::Release);
    }

    /// Reads the page from its segment file, pages past the end of the file read as zeroes.
    pub(crate) fn load(&mut self, files: &SegmentFiles) -> Result<()> {
        debug_assert!(self.pid.is_valid());
        let offset = self.offset();
        files.read_at(self.pid.segment(), offset, &mut self.data)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Writes the page back if it is dirty, returns whether a write happened.
    ///
    /// Only needs shared access: the buffer is read and the dirty flag is atomic.
    pub(crate) fn save(&self, files: &SegmentFiles) -> Result<bool> {
        if !self.is_dirty() || !self.pid.is_valid() {
            return Ok(false);
        }
        files.write_at(self.pid.segment(), self.offset(), &self.data)?;
        self.dirty.store(false, Ordering::Release);
        Ok(true)
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("pid", &self.pid)
            .field("len", &self.data.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Arena entry of the page cache: the latched frame plus the bookkeeping that is read under
/// bucket and queue latches instead of the frame latch.
pub(crate) struct FrameSlot {
    pub(crate) frame: Latch<PageFrame>,
    pid: AtomicU64,
    bucket: AtomicUsize,
    tag: AtomicU8,
    chain: Links,
    queue: Links
}

impl FrameSlot {
    pub(crate) fn new(page_size: usize) -> FrameSlot {
        FrameSlot {
            frame: Latch::new(PageFrame::new(page_size)),
            pid: AtomicU64::new(PageId::INVALID.raw()),
            bucket: AtomicUsize::new(NIL),
            tag: AtomicU8::new(TAG_NONE),
            chain: Links::new(),
            queue: Links::new()
        }
    }

    /// The page this slot holds, readable under the bucket latch.
    #[inline]
    pub(crate) fn pid(&self) -> PageId {
        PageId::from_raw(self.pid.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_pid(&self, pid: PageId) {
        self.pid.store(pid.raw(), Ordering::Release)
    }

    /// Whether the calling thread already holds this frame fixed, shared or exclusive.
    pub(crate) fn is_fixed_by_current_thread(&self) -> bool {
        let key = frame_key(&self.frame);
        FIXED_FRAMES.with(|fixed| fixed.borrow().contains(&key))
    }

    #[inline]
    pub(crate) fn bucket(&self) -> usize {
        self.bucket.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_bucket(&self, bucket: usize) {
        self.bucket.store(bucket, Ordering::Release)
    }

    #[inline]
    pub(crate) fn queue_kind(&self) -> Option<QueueKind> {
        match self.tag.load(Ordering::Acquire) {
            TAG_COLD => Some(QueueKind::Cold),
            TAG_HOT => Some(QueueKind::Hot),
            _ => None
        }
    }

    #[inline]
    pub(crate) fn set_queue_kind(&self, kind: Option<QueueKind>) {
        let tag = match kind {
            Some(QueueKind::Cold) => TAG_COLD,
            Some(QueueKind::Hot) => TAG_HOT,
            None => TAG_NONE
        };
        self.tag.store(tag, Ordering::Release)
    }
}

/// Threads the hash bucket chains.
pub(crate) struct ChainLinks;

impl Adapter for ChainLinks {
    type Node = FrameSlot;

    fn links(node: &FrameSlot) -> &Links {
        &node.chain
    }
}

/// Threads the cold and hot replacement queues.
pub(crate) struct QueueLinks;

impl Adapter for QueueLinks {
    type Node = FrameSlot;

    fn links(node: &FrameSlot) -> &Links {
        &node.queue
    }
}

pub(crate) enum Latched<'a> {
    Shared(SharedGuard<'a, PageFrame>),
    Exclusive(ExclusiveGuard<'a, PageFrame>)
}

impl<'a> Latched<'a> {
    fn latch(&self) -> &'a Latch<PageFrame> {
        match self {
            Latched::Shared(guard) => guard.latch(),
            Latched::Exclusive(guard) => guard.latch()
        }
    }
}

/// A fixed page. The frame stays resident and latched until the guard is dropped or passed to
/// [`PageCache::unfix`](super::PageCache::unfix).
pub struct PageGuard<'a> {
    latched: Latched<'a>
}

impl<'a> PageGuard<'a> {
    pub(crate) fn new(latched: Latched<'a>) -> PageGuard<'a> {
        let key = frame_key(latched.latch());
        FIXED_FRAMES.with(|fixed| fixed.borrow_mut().push(key));
        PageGuard { latched }
    }

    #[inline]
    fn frame(&self) -> &PageFrame {
        match &self.latched {
            Latched::Shared(guard) => &**guard,
            Latched::Exclusive(guard) => &**guard
        }
    }

    #[inline]
    pub fn pid(&self) -> PageId {
        self.frame().pid()
    }

    #[inline]
    pub fn is_exclusive(&self) -> bool {
        matches!(self.latched, Latched::Exclusive(_))
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        self.frame().data()
    }

    /// Mutable view of the page bytes.
    ///
    /// # Panics
    ///
    /// Panics if the page was fixed in shared mode.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.latched {
            Latched::Exclusive(guard) => guard.data_mut(),
            Latched::Shared(guard) => panic!("page {} is fixed in shared mode", guard.pid())
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.frame().is_dirty()
    }

    /// Flags the page for write-back on eviction.
    #[inline]
    pub fn mark_dirty(&self) {
        self.frame().mark_dirty()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        let key = frame_key(self.latched.latch());
        // The thread local may already be gone when a guard is dropped during thread teardown
        let _ = FIXED_FRAMES.try_with(|fixed| {
            let mut fixed = fixed.borrow_mut();
            if let Some(pos) = fixed.iter().position(|k| *k == key) {
                fixed.swap_remove(pos);
            }
        });
    }
}

impl<'a> fmt::Debug for PageGuard<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard")
            .field("pid", &self.pid())
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}
