//! On-page layout of the record store.
//!
//! ```text
//! 0       2        4            8            12       16
//! +-------+--------+------------+------------+--------+------------------+ ... +-----------+
//! | slots | unused | data_start | free_space | unused | slot[0..slots]   | gap | records   |
//! +-------+--------+------------+------------+--------+------------------+ ... +-----------+
//! ```
//!
//! The slot directory grows forward from the header while record bytes grow backward from the
//! end of the page. `free_space` counts every byte not taken by the header, the directory or a
//! live allocation, whether or not it is contiguous; when the gap is too small but `free_space`
//! suffices the page is compacted first.
//!
//! Slots are 16 bytes: `state: u8`, `relocated: u8`, two unused bytes, then `offset`,
//! `capacity` and `len` as `u32`. A redirect keeps the target [`TupleId`] in the first eight
//! bytes of its allocation, so no allocation is smaller than [`MIN_ALLOCATION`].

use crate::ids::TupleId;

pub(crate) const HEADER_SIZE: usize = 16;
pub(crate) const SLOT_SIZE: usize = 16;
pub(crate) const MIN_ALLOCATION: usize = 8;

const SLOT_COUNT_OFFSET: usize = 0;
const DATA_START_OFFSET: usize = 4;
const FREE_SPACE_OFFSET: usize = 8;

const STATE_OFFSET: usize = 0;
const RELOCATED_OFFSET: usize = 1;
const RECORD_OFFSET: usize = 4;
const CAPACITY_OFFSET: usize = 8;
const LEN_OFFSET: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SlotState {
    Empty = 0,
    Used = 1,
    Redirect = 2
}

impl SlotState {
    fn from_tag(tag: u8) -> SlotState {
        match tag {
            1 => SlotState::Used,
            2 => SlotState::Redirect,
            _ => SlotState::Empty
        }
    }
}

/// A decoded slot directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) state: SlotState,
    /// Set on records that are the target of a redirect elsewhere, they are only reachable
    /// through it.
    pub(crate) relocated: bool,
    pub(crate) offset: usize,
    pub(crate) capacity: usize,
    pub(crate) len: usize
}

impl Slot {
    const EMPTY: Slot = Slot {
        state: SlotState::Empty,
        relocated: false,
        offset: 0,
        capacity: 0,
        len: 0
    };
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Entry<'a> {
    Record(&'a [u8]),
    Redirect(TupleId)
}

/// Largest record a page of `page_size` bytes can hold.
pub(crate) fn max_record_size(page_size: usize) -> usize {
    page_size.saturating_sub(HEADER_SIZE + SLOT_SIZE)
}

#[inline]
pub(crate) fn allocation(len: usize) -> usize {
    len.max(MIN_ALLOCATION)
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn slot_offset(i: usize) -> usize {
    HEADER_SIZE + i * SLOT_SIZE
}

/// Read-only view of a record page.
pub(crate) struct SlottedPage<'a> {
    buf: &'a [u8]
}

impl<'a> SlottedPage<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> SlottedPage<'a> {
        SlottedPage { buf }
    }

    #[inline]
    pub(crate) fn slot_count(&self) -> usize {
        read_u16(self.buf, SLOT_COUNT_OFFSET) as usize
    }

    #[inline]
    pub(crate) fn data_start(&self) -> usize {
        read_u32(self.buf, DATA_START_OFFSET) as usize
    }

    #[inline]
    pub(crate) fn free_space(&self) -> usize {
        read_u32(self.buf, FREE_SPACE_OFFSET) as usize
    }

    /// Bytes between the end of the slot directory and the first record.
    pub(crate) fn contiguous_space(&self) -> usize {
        self.data_start().saturating_sub(slot_offset(self.slot_count()))
    }

    pub(crate) fn slot(&self, i: usize) -> Option<Slot> {
        if i >= self.slot_count() {
            return None;
        }

        let at = slot_offset(i);
        Some(Slot {
            state: SlotState::from_tag(self.buf[at + STATE_OFFSET]),
            relocated: self.buf[at + RELOCATED_OFFSET] != 0,
            offset: read_u32(self.buf, at + RECORD_OFFSET) as usize,
            capacity: read_u32(self.buf, at + CAPACITY_OFFSET) as usize,
            len: read_u32(self.buf, at + LEN_OFFSET) as usize
        })
    }

    fn first_empty_slot(&self) -> Option<usize> {
        (0..self.slot_count()).find(|i| self.buf[slot_offset(*i) + STATE_OFFSET] == SlotState::Empty as u8)
    }

    /// Whether a record of `len` bytes fits, counting a new directory entry if no slot is free.
    pub(crate) fn can_insert(&self, len: usize) -> bool {
        let directory = match self.first_empty_slot() {
            Some(_) => 0,
            None if self.slot_count() >= u16::MAX as usize => return false,
            None => SLOT_SIZE
        };
        self.free_space() >= allocation(len) + directory
    }

    pub(crate) fn entry(&self, i: usize) -> Option<Entry<'a>> {
        let buf: &'a [u8] = self.buf;
        let slot = self.slot(i)?;
        match slot.state {
            SlotState::Empty => None,
            SlotState::Used => Some(Entry::Record(&buf[slot.offset..slot.offset + slot.len])),
            SlotState::Redirect => Some(Entry::Redirect(TupleId::from_raw(read_u64(buf, slot.offset))))
        }
    }

    /// Non-empty slots in directory order.
    pub(crate) fn slots(&self) -> impl Iterator<Item = (usize, Slot)> + '_ {
        (0..self.slot_count())
            .filter_map(move |i| self.slot(i).map(|slot| (i, slot)))
            .filter(|(_, slot)| slot.state != SlotState::Empty)
    }
}

/// Mutable view of a record page.
pub(crate) struct SlottedPageMut<'a> {
    buf: &'a mut [u8]
}

impl<'a> SlottedPageMut<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> SlottedPageMut<'a> {
        SlottedPageMut { buf }
    }

    #[inline]
    pub(crate) fn view(&self) -> SlottedPage<'_> {
        SlottedPage::new(self.buf)
    }

    /// Formats the page as empty.
    pub(crate) fn init(&mut self) {
        let len = self.buf.len();
        for b in self.buf[..HEADER_SIZE].iter_mut() {
            *b = 0;
        }
        self.set_slot_count(0);
        self.set_data_start(len);
        self.set_free_space(len - HEADER_SIZE);
    }

    #[inline]
    fn set_slot_count(&mut self, count: usize) {
        self.buf[SLOT_COUNT_OFFSET..SLOT_COUNT_OFFSET + 2].copy_from_slice(&(count as u16).to_le_bytes());
    }

    #[inline]
    fn set_data_start(&mut self, offset: usize) {
        self.buf[DATA_START_OFFSET..DATA_START_OFFSET + 4].copy_from_slice(&(offset as u32).to_le_bytes());
    }

    #[inline]
    fn set_free_space(&mut self, free: usize) {
        self.buf[FREE_SPACE_OFFSET..FREE_SPACE_OFFSET + 4].copy_from_slice(&(free as u32).to_le_bytes());
    }

    fn write_slot(&mut self, i: usize, slot: &Slot) {
        let at = slot_offset(i);
        self.buf[at + STATE_OFFSET] = slot.state as u8;
        self.buf[at + RELOCATED_OFFSET] = slot.relocated as u8;
        self.buf[at + 2] = 0;
        self.buf[at + 3] = 0;
        self.buf[at + RECORD_OFFSET..at + RECORD_OFFSET + 4].copy_from_slice(&(slot.offset as u32).to_le_bytes());
        self.buf[at + CAPACITY_OFFSET..at + CAPACITY_OFFSET + 4].copy_from_slice(&(slot.capacity as u32).to_le_bytes());
        self.buf[at + LEN_OFFSET..at + LEN_OFFSET + 4].copy_from_slice(&(slot.len as u32).to_le_bytes());
    }

    /// Carves `size` bytes off the front of the record area. The caller has made sure the gap is
    /// large enough.
    fn carve(&mut self, size: usize) -> usize {
        let offset = self.view().data_start() - size;
        self.set_data_start(offset);
        offset
    }

    /// Stores `record` in a free or new slot, returning the slot number, or `None` when the page
    /// has no room.
    pub(crate) fn insert(&mut self, record: &[u8], relocated: bool) -> Option<u16> {
        let view = self.view();
        if !view.can_insert(record.len()) {
            return None;
        }

        let reuse = view.first_empty_slot();
        let size = allocation(record.len());
        let gap = size + if reuse.is_some() { 0 } else { SLOT_SIZE };
        if view.contiguous_space() < gap {
            self.compact();
        }

        let index = match reuse {
            Some(i) => i,
            None => {
                let i = self.view().slot_count();
                self.set_slot_count(i + 1);
                self.set_free_space(self.view().free_space() - SLOT_SIZE);
                i
            }
        };

        let offset = self.carve(size);
        self.buf[offset..offset + record.len()].copy_from_slice(record);
        self.write_slot(index, &Slot {
            state: SlotState::Used,
            relocated,
            offset,
            capacity: size,
            len: record.len()
        });
        self.set_free_space(self.view().free_space() - size);

        Some(index as u16)
    }

    /// Replaces the bytes of a used slot, keeping its slot number. Returns false if the slot is
    /// not a record or the page cannot hold the new length.
    pub(crate) fn resize(&mut self, i: usize, record: &[u8]) -> bool {
        let mut slot = match self.view().slot(i) {
            Some(slot) if slot.state == SlotState::Used => slot,
            _ => return false
        };

        let size = allocation(record.len());
        if size <= slot.capacity {
            self.buf[slot.offset..slot.offset + record.len()].copy_from_slice(record);
            slot.len = record.len();
            self.write_slot(i, &slot);
            return true;
        }

        if self.view().free_space() + slot.capacity < size {
            return false;
        }

        // Release the old allocation before making room, so compaction can reclaim it.
        let relocated = slot.relocated;
        self.write_slot(i, &Slot::EMPTY);
        self.set_free_space(self.view().free_space() + slot.capacity);
        if self.view().contiguous_space() < size {
            self.compact();
        }

        let offset = self.carve(size);
        self.buf[offset..offset + record.len()].copy_from_slice(record);
        self.write_slot(i, &Slot {
            state: SlotState::Used,
            relocated,
            offset,
            capacity: size,
            len: record.len()
        });
        self.set_free_space(self.view().free_space() - size);
        true
    }

    /// Turns a used or redirect slot into a redirect to `target`, giving back all but
    /// [`MIN_ALLOCATION`] bytes of its allocation.
    pub(crate) fn redirect(&mut self, i: usize, target: TupleId) -> bool {
        let slot = match self.view().slot(i) {
            Some(slot) if slot.state != SlotState::Empty => slot,
            _ => return false
        };

        self.buf[slot.offset..slot.offset + MIN_ALLOCATION].copy_from_slice(&target.raw().to_le_bytes());
        self.write_slot(i, &Slot {
            state: SlotState::Redirect,
            relocated: false,
            offset: slot.offset,
            capacity: MIN_ALLOCATION,
            len: MIN_ALLOCATION
        });
        self.set_free_space(self.view().free_space() + slot.capacity - MIN_ALLOCATION);
        true
    }

    /// Frees a slot. Trailing empty slots are dropped from the directory.
    pub(crate) fn remove(&mut self, i: usize) -> bool {
        let slot = match self.view().slot(i) {
            Some(slot) if slot.state != SlotState::Empty => slot,
            _ => return false
        };

        self.write_slot(i, &Slot::EMPTY);
        let mut free = self.view().free_space() + slot.capacity;

        let mut count = self.view().slot_count();
        while count > 0 && self.view().slot(count - 1).map_or(false, |s| s.state == SlotState::Empty) {
            count -= 1;
            free += SLOT_SIZE;
        }
        self.set_slot_count(count);
        self.set_free_space(free);
        true
    }

    /// Packs every live allocation against the end of the page, shrinking each to the size its
    /// bytes need. Afterwards the gap equals `free_space`.
    pub(crate) fn compact(&mut self) {
        let len = self.buf.len();
        let mut scratch = vec![0u8; len];
        let mut cursor = len;
        let mut reclaimed = 0;

        for i in 0..self.view().slot_count() {
            let mut slot = match self.view().slot(i) {
                Some(slot) if slot.state != SlotState::Empty => slot,
                _ => continue
            };

            let size = allocation(slot.len);
            cursor -= size;
            scratch[cursor..cursor + slot.len].copy_from_slice(&self.buf[slot.offset..slot.offset + slot.len]);
            reclaimed += slot.capacity - size;
            slot.offset = cursor;
            slot.capacity = size;
            self.write_slot(i, &slot);
        }

        self.buf[cursor..].copy_from_slice(&scratch[cursor..]);
        self.set_data_start(cursor);
        self.set_free_space(self.view().free_space() + reclaimed);
    }
}
