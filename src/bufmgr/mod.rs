//! Fixed-capacity page cache with 2Q replacement.
//!
//! Pages are identified by [`PageId`] and live in one file per segment. A page is pinned in memory
//! by fixing it, which latches its frame in shared or exclusive mode, and released by dropping the
//! returned [`PageGuard`] or passing it to [`PageCache::unfix`].
//!
//! Resident frames are found through a hash table of latched bucket chains. Every resident frame
//! is also a member of one of two replacement queues:
//!
//! - the cold queue, FIFO, where pages land on their first access;
//! - the hot queue, LRU, where pages are promoted when accessed again while cold.
//!
//! Victims are taken from the tail of the cold queue while it holds more than
//! [`CacheConfig::cold_queue_threshold`] of the capacity, otherwise from the tail of the hot
//! queue, falling back to the other queue when the preferred one has no evictable frame.
//!
//! Latches are always acquired in the order bucket, frame, queue (cold before hot). The only
//! exceptions, the victim frame and the victim's bucket taken while holding a queue latch, are
//! never waited on: they are tried and skipped when busy.

use crossbeam_queue::ArrayQueue;
use parking_lot_core::SpinWait;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::ids::PageId;
use crate::latch::ExclusiveGuard;
use crate::list::{ConcurrentList, ListGuard, NIL};

mod files;
mod frame;

pub use files::SegmentFiles;
pub use frame::{PageFrame, PageGuard, QueueKind};

use frame::{ChainLinks, FrameSlot, Latched, QueueLinks};

/// Rounds of victim scans before giving up when candidates were only skipped for bucket
/// contention.
const EVICTION_ROUNDS: usize = 3;

/// Snapshot of the cache counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum Lookup<'a> {
    Hit(PageGuard<'a>),
    Miss,
    Retry
}

enum Scan<'a> {
    Victim(usize, ExclusiveGuard<'a, PageFrame>),
    Contended,
    Exhausted
}

pub struct PageCache {
    config: CacheConfig,
    files: SegmentFiles,
    slots: Box<[FrameSlot]>,
    buckets: Box<[ConcurrentList<ChainLinks>]>,
    cold: ConcurrentList<QueueLinks>,
    hot: ConcurrentList<QueueLinks>,
    free_frames: ArrayQueue<usize>,
    counters: Counters
}

impl PageCache {
    /// Creates an empty cache, the data directory is created if missing.
    pub fn new(config: CacheConfig) -> Result<PageCache> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let capacity = config.capacity;
        let slots: Vec<FrameSlot> = (0..capacity).map(|_| FrameSlot::new(config.page_size)).collect();
        let bucket_count = capacity.next_power_of_two();
        let buckets: Vec<ConcurrentList<ChainLinks>> = (0..bucket_count).map(|_| ConcurrentList::new()).collect();

        let free_frames = ArrayQueue::new(capacity);
        for idx in 0..capacity {
            if free_frames.push(idx).is_err() {
                unreachable!("free frame queue sized to capacity");
            }
        }

        log::debug!(
            "page cache with {} frames of {} bytes, {} buckets, data in {:?}",
            capacity,
            config.page_size,
            bucket_count,
            config.data_dir
        );

        Ok(PageCache {
            files: SegmentFiles::new(config.data_dir.clone()),
            config,
            slots: slots.into_boxed_slice(),
            buckets: buckets.into_boxed_slice(),
            cold: ConcurrentList::new(),
            hot: ConcurrentList::new(),
            free_frames,
            counters: Counters::default()
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of frames that hold, or held, a page.
    pub fn resident_count(&self) -> usize {
        self.capacity() - self.free_frames.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            write_backs: self.counters.write_backs.load(Ordering::Relaxed)
        }
    }

    /// Number of pages in `segment`'s file as it is on disk right now.
    pub fn pages_on_disk(&self, segment: u16) -> Result<u32> {
        let len = self.files.len(segment)?;
        let page_size = self.page_size() as u64;
        Ok(((len + page_size - 1) / page_size) as u32)
    }

    #[inline]
    fn bucket_of(&self, pid: PageId) -> usize {
        pid.page() as usize & (self.buckets.len() - 1)
    }

    #[inline]
    fn queue(&self, kind: QueueKind) -> &ConcurrentList<QueueLinks> {
        match kind {
            QueueKind::Cold => &self.cold,
            QueueKind::Hot => &self.hot
        }
    }

    /// Pins page `pid` in memory, loading it from its segment file if needed, and latches it in
    /// exclusive or shared mode.
    ///
    /// Fails with [`Error::AlreadyLocked`] if the calling thread already holds the page fixed, in
    /// either mode, with [`Error::OutOfFrames`] if every frame is latched and with [`Error::Io`]
    /// if the page could not be read or a victim could not be written back.
    pub fn fix(&self, pid: PageId, exclusive: bool) -> Result<PageGuard<'_>> {
        debug_assert!(pid.is_valid(), "fixing the invalid page id");
        let mut spinwait = SpinWait::new();
        loop {
            match self.fix_resident(pid, exclusive)? {
                Lookup::Hit(guard) => {
                    Counters::bump(&self.counters.hits);
                    return Ok(guard);
                }
                Lookup::Retry => {
                    if !spinwait.spin() {
                        spinwait.reset();
                    }
                    continue;
                }
                Lookup::Miss => {}
            }

            if let Some(guard) = self.fix_missing(pid, exclusive)? {
                Counters::bump(&self.counters.misses);
                return Ok(guard);
            }
        }
    }

    /// Releases a fixed page, flagging it for write-back if `dirty`.
    pub fn unfix(&self, guard: PageGuard<'_>, dirty: bool) {
        if dirty {
            guard.mark_dirty();
        }
        drop(guard);
    }

    fn latch<'a>(slot: &'a FrameSlot, exclusive: bool) -> Latched<'a> {
        if exclusive {
            Latched::Exclusive(slot.frame.exclusive())
        } else {
            Latched::Shared(slot.frame.shared())
        }
    }

    fn try_latch<'a>(slot: &'a FrameSlot, exclusive: bool) -> Option<Latched<'a>> {
        if exclusive {
            slot.frame.try_exclusive().map(Latched::Exclusive)
        } else {
            slot.frame.try_shared().map(Latched::Shared)
        }
    }

    fn fix_resident(&self, pid: PageId, exclusive: bool) -> Result<Lookup<'_>> {
        let chain = self.buckets[self.bucket_of(pid)].read(&self.slots);
        let idx = match chain.iter().find(|idx| self.slots[*idx].pid() == pid) {
            Some(idx) => idx,
            None => return Ok(Lookup::Miss)
        };

        let slot = &self.slots[idx];
        // Neither latch mode is reentrant, waiting on our own frame would never return
        if slot.is_fixed_by_current_thread() {
            return Err(Error::AlreadyLocked(pid));
        }

        // Never block on a frame while holding its bucket, whoever holds the frame may be
        // allocating a victim under the same bucket.
        let latched = match Self::try_latch(slot, exclusive) {
            Some(latched) => {
                drop(chain);
                latched
            }
            None => {
                drop(chain);
                Self::latch(slot, exclusive)
            }
        };

        let guard = PageGuard::new(latched);
        if guard.pid() != pid {
            log::trace!("frame {} changed from page {} while waiting", idx, pid);
            return Ok(Lookup::Retry);
        }

        self.register_access(idx);
        Ok(Lookup::Hit(guard))
    }

    /// Applies the 2Q policy to a frame the caller holds latched.
    fn register_access(&self, idx: usize) {
        let slot = &self.slots[idx];
        match slot.queue_kind() {
            Some(QueueKind::Hot) => {
                let mut hot = self.hot.lock(&self.slots);
                if slot.queue_kind() == Some(QueueKind::Hot) {
                    hot.move_to_front(idx);
                }
            }
            Some(QueueKind::Cold) => {
                let mut cold = self.cold.lock(&self.slots);
                let mut hot = self.hot.lock(&self.slots);
                match slot.queue_kind() {
                    Some(QueueKind::Cold) => {
                        cold.remove(idx);
                        hot.prepend(idx);
                        slot.set_queue_kind(Some(QueueKind::Hot));
                    }
                    Some(QueueKind::Hot) => hot.move_to_front(idx),
                    None => {}
                }
            }
            None => {}
        }
    }

    fn fix_missing(&self, pid: PageId, exclusive: bool) -> Result<Option<PageGuard<'_>>> {
        let bucket = self.bucket_of(pid);
        let mut chain = self.buckets[bucket].lock(&self.slots);

        // Someone else may have loaded it between our scan and the exclusive latch
        if chain.iter().any(|idx| self.slots[idx].pid() == pid) {
            return Ok(None);
        }

        let (idx, mut frame) = self.allocate(bucket, &mut chain)?;
        let slot = &self.slots[idx];

        frame.assign(pid);
        slot.set_pid(pid);
        slot.set_bucket(bucket);
        chain.prepend(idx);
        {
            let mut cold = self.cold.lock(&self.slots);
            cold.prepend(idx);
            slot.set_queue_kind(Some(QueueKind::Cold));
        }
        drop(chain);

        if let Err(e) = frame.load(&self.files) {
            log::debug!("failed to load page {}: {}", pid, e);
            // Left linked with no identity, eviction recycles it
            frame.assign(PageId::INVALID);
            slot.set_pid(PageId::INVALID);
            return Err(e);
        }

        log::trace!("loaded page {} into frame {}", pid, idx);

        let latched = if exclusive {
            Latched::Exclusive(frame)
        } else {
            Latched::Shared(frame.downgrade())
        };

        Ok(Some(PageGuard::new(latched)))
    }

    /// Finds an unused frame, evicting a resident page if there is none. The returned frame is
    /// latched exclusively and unlinked from every list.
    fn allocate<'a>(
        &'a self,
        bucket: usize,
        chain: &mut ListGuard<'a, ChainLinks>
    ) -> Result<(usize, ExclusiveGuard<'a, PageFrame>)> {
        if let Some(idx) = self.free_frames.pop() {
            return Ok((idx, self.slots[idx].frame.exclusive()));
        }

        let order = if self.cold.len() > self.config.cold_queue_limit() {
            [QueueKind::Cold, QueueKind::Hot]
        } else {
            [QueueKind::Hot, QueueKind::Cold]
        };

        for round in 0..EVICTION_ROUNDS {
            let mut contended = false;
            for kind in order.iter() {
                match self.evict_from(*kind, bucket, chain)? {
                    Scan::Victim(idx, frame) => return Ok((idx, frame)),
                    Scan::Contended => contended = true,
                    Scan::Exhausted => {}
                }
            }

            if !contended {
                break;
            }
            log::trace!("eviction round {} only met contended buckets", round);
        }

        Err(Error::OutOfFrames { capacity: self.capacity() })
    }

    fn evict_from<'a>(
        &'a self,
        kind: QueueKind,
        own_bucket: usize,
        chain: &mut ListGuard<'a, ChainLinks>
    ) -> Result<Scan<'a>> {
        let mut queue = self.queue(kind).lock(&self.slots);
        let mut contended = false;
        let mut cur = queue.last();

        while cur != NIL {
            let prev = queue.prev_of(cur);
            let slot = &self.slots[cur];

            let frame = match slot.frame.try_exclusive() {
                Some(frame) => frame,
                None => {
                    cur = prev;
                    continue;
                }
            };

            let victim_bucket = slot.bucket();
            if victim_bucket == own_bucket {
                self.detach(cur, &frame, kind, &mut queue, chain)?;
            } else {
                match self.try_lock_bucket(victim_bucket) {
                    Some(mut other) => self.detach(cur, &frame, kind, &mut queue, &mut other)?,
                    None => {
                        contended = true;
                        cur = prev;
                        continue;
                    }
                }
            }

            return Ok(Scan::Victim(cur, frame));
        }

        Ok(if contended { Scan::Contended } else { Scan::Exhausted })
    }

    /// Writes the victim back if needed and removes it from its bucket and queue. On write
    /// failure the page stays resident and dirty.
    fn detach(
        &self,
        idx: usize,
        frame: &PageFrame,
        kind: QueueKind,
        queue: &mut ListGuard<'_, QueueLinks>,
        chain: &mut ListGuard<'_, ChainLinks>
    ) -> Result<()> {
        let written = frame.save(&self.files)?;
        if written {
            Counters::bump(&self.counters.write_backs);
        }

        let slot = &self.slots[idx];
        chain.remove(idx);
        queue.remove(idx);
        slot.set_queue_kind(None);
        slot.set_pid(PageId::INVALID);
        slot.set_bucket(NIL);

        Counters::bump(&self.counters.evictions);
        log::debug!("evicted page {} from the {:?} queue (written back: {})", frame.pid(), kind, written);
        Ok(())
    }

    fn try_lock_bucket(&self, bucket: usize) -> Option<ListGuard<'_, ChainLinks>> {
        let list = &self.buckets[bucket];
        for attempt in 0..=self.config.eviction_retries {
            if let Some(guard) = list.try_lock(&self.slots) {
                return Some(guard);
            }
            if attempt < self.config.eviction_retries {
                std::thread::sleep(self.config.eviction_backoff());
            }
        }
        None
    }

    /// The queue holding `pid`, or `None` if it is not resident.
    pub fn queue_of(&self, pid: PageId) -> Option<QueueKind> {
        let chain = self.buckets[self.bucket_of(pid)].read(&self.slots);
        let idx = chain.iter().find(|idx| self.slots[*idx].pid() == pid)?;
        self.slots[idx].queue_kind()
    }

    pub fn is_resident(&self, pid: PageId) -> bool {
        let chain = self.buckets[self.bucket_of(pid)].read(&self.slots);
        let found = chain.iter().any(|idx| self.slots[idx].pid() == pid);
        found
    }

    /// Writes every dirty frame back and syncs the segment files, returns the number of pages
    /// written.
    ///
    /// Blocks on frames latched exclusively by other threads; must not be called while the
    /// calling thread holds a frame exclusively.
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        for slot in self.slots.iter() {
            let frame = slot.frame.shared();
            if frame.save(&self.files)? {
                Counters::bump(&self.counters.write_backs);
                written += 1;
            }
        }
        self.files.sync_all()?;
        log::debug!("flushed {} dirty pages", written);
        Ok(written)
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            log::warn!("failed to flush page cache on shutdown: {}", e);
        }
    }
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("config", &self.config)
            .field("resident", &self.resident_count())
            .field("cold", &self.cold.len())
            .field("hot", &self.hot.len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{PageCache, QueueKind};
    use crate::config::CacheConfig;
    use crate::error::Error;
    use crate::ids::PageId;
    use crate::util::init_logging;

    use rand::{rngs::StdRng, Rng, SeedableRng};
    use serial_test::serial;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    const PAGE: usize = 1024;

    fn cache(dir: &tempfile::TempDir, capacity: usize) -> PageCache {
        init_logging();
        PageCache::new(CacheConfig::new(dir.path()).with_capacity(capacity).with_page_size(PAGE)).unwrap()
    }

    fn write_u64(cache: &PageCache, pid: PageId, value: u64) {
        let mut guard = cache.fix(pid, true).unwrap();
        guard.data_mut()[..8].copy_from_slice(&value.to_le_bytes());
        cache.unfix(guard, true);
    }

    fn read_u64(cache: &PageCache, pid: PageId) -> u64 {
        let guard = cache.fix(pid, false).unwrap();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&guard.data()[..8]);
        u64::from_le_bytes(bytes)
    }

    #[test]
    fn new_pages_read_as_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 4);
        let guard = cache.fix(PageId::new(0, 17), false).unwrap();
        assert_eq!(guard.pid(), PageId::new(0, 17));
        assert!(!guard.is_exclusive());
        assert!(guard.data().iter().all(|b| *b == 0));
        assert_eq!(guard.data().len(), PAGE);
    }

    #[test]
    fn bucket_count_is_power_of_two() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cache(&dir, 5).bucket_count(), 8);
        assert_eq!(cache(&dir, 8).bucket_count(), 8);
        assert_eq!(cache(&dir, 1).bucket_count(), 1);
    }

    #[test]
    fn resident_pages_never_exceed_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 3);
        for page in 0..20 {
            let guard = cache.fix(PageId::new(1, page), page % 2 == 0).unwrap();
            drop(guard);
            assert!(cache.resident_count() <= 3);
        }
        let resident = (0..20).filter(|p| cache.is_resident(PageId::new(1, *p))).count();
        assert_eq!(resident, 3);
        assert_eq!(cache.stats().evictions, 17);
    }

    #[test]
    fn dirty_pages_survive_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 2);
        for page in 0..10u32 {
            write_u64(&cache, PageId::new(2, page), page as u64 * 1000 + 7);
        }
        for page in 0..10u32 {
            assert_eq!(read_u64(&cache, PageId::new(2, page)), page as u64 * 1000 + 7);
        }
        assert!(cache.stats().write_backs >= 8);
    }

    #[test]
    fn clean_pages_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 1);
        let guard = cache.fix(PageId::new(3, 5), true).unwrap();
        cache.unfix(guard, false);
        cache.fix(PageId::new(3, 6), false).unwrap();
        assert_eq!(cache.stats().write_backs, 0);
        assert_eq!(cache.pages_on_disk(3).unwrap(), 0);
    }

    #[test]
    fn second_access_promotes_to_hot() {
        let dir = tempfile::tempdir().unwrap();
        init_logging();
        let config = CacheConfig::new(dir.path())
            .with_capacity(4)
            .with_page_size(PAGE)
            .with_cold_queue_threshold(0.5);
        let cache = PageCache::new(config).unwrap();

        let (a, b, c, d, e) = (
            PageId::new(0, 0),
            PageId::new(0, 1),
            PageId::new(0, 2),
            PageId::new(0, 3),
            PageId::new(0, 4)
        );

        cache.fix(a, false).unwrap();
        cache.fix(b, false).unwrap();
        assert_eq!(cache.queue_of(a), Some(QueueKind::Cold));

        cache.fix(a, false).unwrap();
        assert_eq!(cache.queue_of(a), Some(QueueKind::Hot));

        cache.fix(c, false).unwrap();
        cache.fix(d, false).unwrap();
        // cold holds d, c, b: above the limit of 2, so the cold tail goes first
        cache.fix(e, false).unwrap();

        assert!(!cache.is_resident(b));
        assert_eq!(cache.queue_of(a), Some(QueueKind::Hot));
        assert_eq!(cache.queue_of(e), Some(QueueKind::Cold));
    }

    #[test]
    fn hot_queue_is_lru() {
        let dir = tempfile::tempdir().unwrap();
        init_logging();
        let config = CacheConfig::new(dir.path())
            .with_capacity(3)
            .with_page_size(PAGE)
            .with_cold_queue_threshold(0.5);
        let cache = PageCache::new(config).unwrap();

        let pids: Vec<PageId> = (0..4).map(|p| PageId::new(0, p)).collect();
        for pid in &pids[..3] {
            cache.fix(*pid, false).unwrap();
            cache.fix(*pid, false).unwrap();
        }
        // hot is 2, 1, 0; touching 0 again makes 1 the least recently used
        cache.fix(pids[0], false).unwrap();
        cache.fix(pids[3], false).unwrap();

        assert!(cache.is_resident(pids[0]));
        assert!(!cache.is_resident(pids[1]));
        assert!(cache.is_resident(pids[2]));
        assert_eq!(cache.queue_of(pids[3]), Some(QueueKind::Cold));
    }

    #[test]
    fn refixing_own_exclusive_page_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 2);
        let pid = PageId::new(0, 1);
        let guard = cache.fix(pid, true).unwrap();
        assert!(matches!(cache.fix(pid, false), Err(Error::AlreadyLocked(p)) if p == pid));
        assert!(matches!(cache.fix(pid, true), Err(Error::AlreadyLocked(_))));
        drop(guard);
        assert!(cache.fix(pid, true).is_ok());
    }

    #[test]
    fn refixing_own_shared_page_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(&dir, 2));
        let pid = PageId::new(0, 1);
        let guard = cache.fix(pid, false).unwrap();
        assert!(matches!(cache.fix(pid, true), Err(Error::AlreadyLocked(p)) if p == pid));
        assert!(matches!(cache.fix(pid, false), Err(Error::AlreadyLocked(_))));

        // Other threads still share it
        let other = {
            let cache = cache.clone();
            thread::spawn(move || {
                let fixed = cache.fix(pid, false).map(|guard| guard.pid());
                fixed.ok()
            })
        };
        assert_eq!(other.join().unwrap(), Some(pid));

        // Different pages stay available to the holder
        assert!(cache.fix(PageId::new(0, 2), true).is_ok());
        drop(guard);
        assert!(cache.fix(pid, true).is_ok());
        assert!(cache.fix(pid, false).is_ok());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn failed_write_back_keeps_victim_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 1);
        std::os::unix::fs::symlink("/dev/full", dir.path().join("5")).unwrap();

        let victim = PageId::new(5, 0);
        let mut guard = cache.fix(victim, true).unwrap();
        guard.data_mut()[0] = 77;
        cache.unfix(guard, true);

        assert!(matches!(cache.fix(PageId::new(1, 0), false), Err(Error::Io(_))));
        assert!(cache.is_resident(victim));
        assert!(!cache.is_resident(PageId::new(1, 0)));
        assert_eq!(cache.stats().evictions, 0);

        let guard = cache.fix(victim, false).unwrap();
        assert_eq!(guard.data()[0], 77);
        assert!(guard.is_dirty());
    }

    #[test]
    fn contended_victim_bucket_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        init_logging();
        let config = CacheConfig::new(dir.path())
            .with_capacity(2)
            .with_page_size(PAGE)
            .with_eviction_retries(3)
            .with_eviction_backoff(Duration::from_millis(2));
        let cache = PageCache::new(config).unwrap();

        // Two buckets: even pages hash to 0, odd pages to 1
        let (a, b, c) = (PageId::new(0, 0), PageId::new(0, 1), PageId::new(0, 3));
        cache.fix(a, false).unwrap();
        cache.fix(b, false).unwrap();

        let start = Instant::now();
        {
            let _held = cache.buckets[cache.bucket_of(a)].lock(&cache.slots);
            // a is the cold tail but its bucket is busy, so b goes instead
            cache.fix(c, false).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(6));

        assert!(cache.is_resident(a));
        assert!(!cache.is_resident(b));
        assert!(cache.is_resident(c));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn only_contended_victims_is_out_of_frames() {
        let dir = tempfile::tempdir().unwrap();
        init_logging();
        let config = CacheConfig::new(dir.path())
            .with_capacity(2)
            .with_page_size(PAGE)
            .with_eviction_retries(1)
            .with_eviction_backoff(Duration::from_micros(100));
        let cache = PageCache::new(config).unwrap();

        let (a, b, c) = (PageId::new(0, 0), PageId::new(0, 2), PageId::new(0, 1));
        cache.fix(a, false).unwrap();
        cache.fix(b, false).unwrap();

        {
            let _held = cache.buckets[cache.bucket_of(a)].lock(&cache.slots);
            assert!(matches!(cache.fix(c, false), Err(Error::OutOfFrames { capacity: 2 })));
        }
        assert!(cache.is_resident(a));
        assert!(cache.is_resident(b));

        cache.fix(c, false).unwrap();
        assert!(!cache.is_resident(a));
        assert!(cache.is_resident(c));
    }

    #[test]
    fn all_frames_latched_is_out_of_frames() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 2);
        let _a = cache.fix(PageId::new(0, 0), false).unwrap();
        let _b = cache.fix(PageId::new(0, 1), true).unwrap();
        match cache.fix(PageId::new(0, 2), false) {
            Err(Error::OutOfFrames { capacity }) => assert_eq!(capacity, 2),
            other => panic!("unexpected {:?}", other)
        };
    }

    #[test]
    fn load_failure_is_reported_and_frame_recycled() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 1);
        // A directory where the segment file should be makes every open fail
        std::fs::create_dir(dir.path().join("9")).unwrap();

        assert!(matches!(cache.fix(PageId::new(9, 0), false), Err(Error::Io(_))));
        assert!(!cache.is_resident(PageId::new(9, 0)));

        write_u64(&cache, PageId::new(1, 0), 99);
        assert_eq!(read_u64(&cache, PageId::new(1, 0)), 99);
    }

    #[test]
    fn flush_all_writes_dirty_frames() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        for page in 0..4 {
            write_u64(&cache, PageId::new(6, page), 1);
        }
        assert_eq!(cache.flush_all().unwrap(), 4);
        assert_eq!(cache.flush_all().unwrap(), 0);
        assert_eq!(cache.pages_on_disk(6).unwrap(), 4);
    }

    #[test]
    fn drop_flushes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = cache(&dir, 8);
            write_u64(&cache, PageId::new(0, 3), 0xfeed);
        }
        let cache = cache(&dir, 8);
        assert_eq!(read_u64(&cache, PageId::new(0, 3)), 0xfeed);
    }

    #[test]
    #[serial]
    fn exclusive_fixes_serialize_writers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(&dir, 8));
        let n_threads = 4;
        let n_pages = 16u32;
        let per_thread = 2_000;
        let barrier = Arc::new(Barrier::new(n_threads));

        let mut handles = vec![];
        for t in 0..n_threads {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                barrier.wait();
                for _ in 0..per_thread {
                    let pid = PageId::new(0, rng.gen_range(0..n_pages));
                    let mut guard = cache.fix(pid, true).unwrap();
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&guard.data()[..8]);
                    let value = u64::from_le_bytes(bytes) + 1;
                    guard.data_mut()[..8].copy_from_slice(&value.to_le_bytes());
                    cache.unfix(guard, true);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = (0..n_pages).map(|p| read_u64(&cache, PageId::new(0, p))).sum();
        assert_eq!(total, (n_threads * per_thread) as u64);
        assert!(cache.resident_count() <= 8);
    }

    #[test]
    #[serial]
    fn concurrent_readers_share_frames() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(&dir, 4));
        for page in 0..8 {
            write_u64(&cache, PageId::new(0, page), page as u64);
        }

        let n_threads = 4;
        let barrier = Arc::new(Barrier::new(n_threads));
        let mut handles = vec![];
        for t in 0..n_threads {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + t as u64);
                barrier.wait();
                for _ in 0..2_000 {
                    let page = rng.gen_range(0..8u32);
                    assert_eq!(read_u64(&cache, PageId::new(0, page)), page as u64);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
