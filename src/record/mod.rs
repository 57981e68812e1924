//! Slotted-page record store.
//!
//! Records are variable-length byte strings addressed by a [`TupleId`] that never changes for the
//! lifetime of the record. A record that outgrows its page moves to another page and leaves a
//! redirect behind in its home slot, so lookups take at most one extra hop.
//!
//! At most one page is fixed at any time, which keeps the store safe to use next to other cache
//! users without any ordering between pages.

use log::debug;
use parking_lot::Mutex;

use std::sync::Arc;

use crate::bufmgr::PageCache;
use crate::error::{Error, Result};
use crate::ids::{PageId, TupleId};
use crate::segment::Segment;

mod slotted_page;

use slotted_page::{allocation, max_record_size, Entry, SlotState, SlottedPage, SlottedPageMut};

/// What the home slot of an update or removal turned out to hold.
enum Home {
    Missing,
    Done,
    NoRoom,
    Moved(TupleId)
}

pub struct SpSegment {
    cache: Arc<PageCache>,
    segment: Segment,
    /// Last seen free space of every page, indexed by page number. Only a hint: the page itself
    /// is checked under its latch.
    free_space: Mutex<Vec<u32>>
}

impl SpSegment {
    /// Wraps `segment`, reading the free space of any page it already holds.
    pub fn new(cache: Arc<PageCache>, segment: Segment) -> Result<SpSegment> {
        let mut hints = Vec::with_capacity(segment.page_count() as usize);
        for page in 0..segment.page_count() {
            let guard = cache.fix(segment.page(page), false)?;
            hints.push(SlottedPage::new(guard.data()).free_space() as u32);
        }

        Ok(SpSegment {
            cache,
            segment,
            free_space: Mutex::new(hints)
        })
    }

    /// Reopens the record segment `id` from its file.
    pub fn open(cache: Arc<PageCache>, id: u16) -> Result<SpSegment> {
        let segment = Segment::open(&cache, id)?;
        SpSegment::new(cache, segment)
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Largest record this store accepts.
    pub fn max_record_size(&self) -> usize {
        max_record_size(self.cache.page_size())
    }

    fn check_size(&self, len: usize) -> Result<()> {
        let max = self.max_record_size();
        if len > max {
            return Err(Error::RecordTooLarge { size: len, max });
        }
        Ok(())
    }

    fn set_hint(&self, page: u32, free: usize) {
        let mut hints = self.free_space.lock();
        let page = page as usize;
        if hints.len() <= page {
            hints.resize(page + 1, 0);
        }
        hints[page] = free as u32;
    }

    fn next_candidate(&self, from: u32, size: usize) -> Option<u32> {
        let hints = self.free_space.lock();
        hints
            .iter()
            .enumerate()
            .skip(from as usize)
            .find(|(_, free)| **free as usize >= size)
            .map(|(page, _)| page as u32)
    }

    /// Stores a new record and returns its id.
    pub fn insert(&self, record: &[u8]) -> Result<TupleId> {
        self.check_size(record.len())?;
        self.place(record, false, None)
    }

    /// Puts `record` on the first page with room, skipping `skip`, or on a fresh page.
    fn place(&self, record: &[u8], relocated: bool, skip: Option<u32>) -> Result<TupleId> {
        let size = allocation(record.len());
        let mut from = 0;

        while let Some(page) = self.next_candidate(from, size) {
            from = page + 1;
            if skip == Some(page) {
                continue;
            }

            let pid = self.segment.page(page);
            let mut guard = self.cache.fix(pid, true)?;
            let (slot, free) = {
                let mut sp = SlottedPageMut::new(guard.data_mut());
                let slot = sp.insert(record, relocated);
                (slot, sp.view().free_space())
            };
            self.cache.unfix(guard, slot.is_some());
            self.set_hint(page, free);

            if let Some(slot) = slot {
                return Ok(TupleId::from_page(pid, slot));
            }
        }

        let pid = self.segment.add_page();
        debug!("record segment {} grows to page {}", self.segment.id(), pid.page());

        let mut guard = self.cache.fix(pid, true)?;
        let (slot, free) = {
            let mut sp = SlottedPageMut::new(guard.data_mut());
            sp.init();
            let slot = sp.insert(record, relocated);
            (slot, sp.view().free_space())
        };
        self.cache.unfix(guard, true);
        self.set_hint(pid.page(), free);

        match slot {
            Some(slot) => Ok(TupleId::from_page(pid, slot)),
            None => Err(Error::RecordTooLarge {
                size: record.len(),
                max: self.max_record_size()
            })
        }
    }

    /// Returns a copy of the record, following a redirect if the record has moved.
    pub fn lookup(&self, tid: TupleId) -> Result<Option<Vec<u8>>> {
        if !self.segment.contains(tid.page_id()) {
            return Ok(None);
        }

        let target = {
            let guard = self.cache.fix(tid.page_id(), false)?;
            let page = SlottedPage::new(guard.data());
            let slot = tid.tuple() as usize;
            if page.slot(slot).map_or(true, |s| s.relocated) {
                return Ok(None);
            }

            let entry = page.entry(slot);
            match entry {
                None => return Ok(None),
                Some(Entry::Record(bytes)) => return Ok(Some(bytes.to_vec())),
                Some(Entry::Redirect(target)) => target
            }
        };

        self.lookup_moved(target)
    }

    fn lookup_moved(&self, tid: TupleId) -> Result<Option<Vec<u8>>> {
        if !self.segment.contains(tid.page_id()) {
            return Ok(None);
        }

        let guard = self.cache.fix(tid.page_id(), false)?;
        let record = match SlottedPage::new(guard.data()).entry(tid.tuple() as usize) {
            Some(Entry::Record(bytes)) => Some(bytes.to_vec()),
            _ => None
        };
        Ok(record)
    }

    /// Tries to replace the record at `tid` in place. Reports what was found instead when the
    /// slot is not a record with enough room on its page.
    fn resize_at(&self, tid: TupleId, record: &[u8], relocated: bool) -> Result<Home> {
        let mut guard = self.cache.fix(tid.page_id(), true)?;
        let slot = tid.tuple() as usize;
        let (home, free) = {
            let mut sp = SlottedPageMut::new(guard.data_mut());
            let current = sp.view().slot(slot);
            let home = match current {
                Some(s) if s.relocated != relocated => Home::Missing,
                Some(s) if s.state == SlotState::Used => {
                    if sp.resize(slot, record) {
                        Home::Done
                    } else {
                        Home::NoRoom
                    }
                }
                Some(s) if s.state == SlotState::Redirect => match sp.view().entry(slot) {
                    Some(Entry::Redirect(target)) => Home::Moved(target),
                    _ => Home::Missing
                },
                _ => Home::Missing
            };
            (home, sp.view().free_space())
        };

        let dirty = matches!(home, Home::Done);
        self.cache.unfix(guard, dirty);
        if dirty {
            self.set_hint(tid.page(), free);
        }
        Ok(home)
    }

    /// Points the redirect or record slot `tid` at `target`. Returns false if the slot was
    /// emptied in the meantime.
    fn redirect(&self, tid: TupleId, target: TupleId) -> Result<bool> {
        let mut guard = self.cache.fix(tid.page_id(), true)?;
        let (redirected, free) = {
            let mut sp = SlottedPageMut::new(guard.data_mut());
            let redirected = sp.redirect(tid.tuple() as usize, target);
            (redirected, sp.view().free_space())
        };
        self.cache.unfix(guard, redirected);
        if redirected {
            self.set_hint(tid.page(), free);
        }
        Ok(redirected)
    }

    /// Replaces the record at `tid`, keeping its id. Returns false if there is no such record.
    pub fn update(&self, tid: TupleId, record: &[u8]) -> Result<bool> {
        self.check_size(record.len())?;
        if !self.segment.contains(tid.page_id()) {
            return Ok(false);
        }

        match self.resize_at(tid, record, false)? {
            Home::Missing => Ok(false),
            Home::Done => Ok(true),
            Home::NoRoom => {
                let moved = self.place(record, true, Some(tid.page()))?;
                debug!("record {} moves to {}", tid, moved);
                if self.redirect(tid, moved)? {
                    Ok(true)
                } else {
                    self.remove_slot(moved)?;
                    Ok(false)
                }
            }
            Home::Moved(target) => {
                if !self.segment.contains(target.page_id()) {
                    return Ok(false);
                }

                match self.resize_at(target, record, true)? {
                    Home::Done => Ok(true),
                    Home::NoRoom => {
                        let moved = self.place(record, true, Some(target.page()))?;
                        debug!("record {} moves again from {} to {}", tid, target, moved);
                        self.remove_slot(target)?;
                        self.redirect(tid, moved)
                    }
                    _ => Ok(false)
                }
            }
        }
    }

    fn remove_slot(&self, tid: TupleId) -> Result<Option<TupleId>> {
        let mut guard = self.cache.fix(tid.page_id(), true)?;
        let slot = tid.tuple() as usize;
        let (removed, free) = {
            let mut sp = SlottedPageMut::new(guard.data_mut());
            let target = match sp.view().entry(slot) {
                Some(Entry::Redirect(target)) => Some(target),
                _ => None
            };
            let removed = if sp.remove(slot) { Some(target) } else { None };
            (removed, sp.view().free_space())
        };
        self.cache.unfix(guard, removed.is_some());
        if removed.is_some() {
            self.set_hint(tid.page(), free);
        }
        Ok(removed.flatten())
    }

    /// Deletes the record at `tid` together with its moved copy, if any. Returns false if there
    /// is no such record.
    pub fn remove(&self, tid: TupleId) -> Result<bool> {
        if !self.segment.contains(tid.page_id()) {
            return Ok(false);
        }

        {
            let guard = self.cache.fix(tid.page_id(), false)?;
            let visible = SlottedPage::new(guard.data())
                .slot(tid.tuple() as usize)
                .map_or(false, |s| s.state != SlotState::Empty && !s.relocated);
            if !visible {
                return Ok(false);
            }
        }

        if let Some(target) = self.remove_slot(tid)? {
            if self.segment.contains(target.page_id()) {
                self.remove_slot(target)?;
            }
        }
        Ok(true)
    }

    /// Every record with its id, in page and slot order.
    pub fn scan(&self) -> Result<Vec<(TupleId, Vec<u8>)>> {
        let mut records = vec![];
        for page in 0..self.segment.page_count() {
            let pid: PageId = self.segment.page(page);
            let mut moved = vec![];
            {
                let guard = self.cache.fix(pid, false)?;
                let sp = SlottedPage::new(guard.data());
                for (slot, info) in sp.slots() {
                    if info.relocated {
                        continue;
                    }
                    let tid = TupleId::from_page(pid, slot as u16);
                    match sp.entry(slot) {
                        Some(Entry::Record(bytes)) => records.push((tid, bytes.to_vec())),
                        Some(Entry::Redirect(target)) => moved.push((tid, target)),
                        None => {}
                    }
                }
            }

            for (tid, target) in moved {
                if let Some(bytes) = self.lookup_moved(target)? {
                    records.push((tid, bytes));
                }
            }
        }
        Ok(records)
    }
}

impl std::fmt::Debug for SpSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpSegment")
            .field("segment", &self.segment.id())
            .field("pages", &self.segment.page_count())
            .finish()
    }
}
