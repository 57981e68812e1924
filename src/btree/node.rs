//! On-page node layout.
//!
//! ```text
//! 0      1        4         8                16
//! +------+--------+---------+----------------+---------------------+------------------------+
//! | kind | unused |  count  |      next      | keys[capacity]      | values[capacity + 1]   |
//! +------+--------+---------+----------------+---------------------+------------------------+
//! ```
//!
//! Leaves store `count` key/value pairs, values are raw [`TupleId`](crate::ids::TupleId)s and
//! `next` links to the right sibling. Inner nodes store `count` separators and `count + 1` child
//! page ids: child `i` holds the keys ordered before `keys[i]`, the last child everything else.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::ids::PageId;

use super::key::{Comparator, NodeKey};

pub(crate) const HEADER_SIZE: usize = 16;

const KIND_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;
const NEXT_OFFSET: usize = 8;
const VALUE_SIZE: usize = 8;

/// Smallest fan-out that still leaves both halves of a split inner node non-empty.
pub(crate) const MIN_CAPACITY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Inner = 1,
    Leaf = 2
}

/// Where keys and values live for a given page size and key width.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    capacity: usize,
    key_size: usize,
    values_offset: usize
}

impl Layout {
    pub(crate) fn new<K: NodeKey>(page_size: usize, max_entries: Option<usize>) -> Result<Layout> {
        let fits = page_size.saturating_sub(HEADER_SIZE + VALUE_SIZE) / (K::SIZE + VALUE_SIZE);
        let capacity = max_entries.map_or(fits, |max| max.min(fits));
        if capacity < MIN_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "node capacity {} below the minimum of {} (page size {}, key size {})",
                capacity,
                MIN_CAPACITY,
                page_size,
                K::SIZE
            )));
        }

        Ok(Layout {
            capacity,
            key_size: K::SIZE,
            values_offset: HEADER_SIZE + capacity * K::SIZE
        })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn key_offset(&self, i: usize) -> usize {
        HEADER_SIZE + i * self.key_size
    }

    #[inline]
    fn value_offset(&self, i: usize) -> usize {
        self.values_offset + i * VALUE_SIZE
    }
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

/// Read-only view of a node page.
pub(crate) struct Node<'a, K> {
    buf: &'a [u8],
    layout: &'a Layout,
    _key: PhantomData<K>
}

impl<'a, K: NodeKey> Node<'a, K> {
    pub(crate) fn new(buf: &'a [u8], layout: &'a Layout) -> Node<'a, K> {
        Node {
            buf,
            layout,
            _key: PhantomData
        }
    }

    pub(crate) fn kind(&self) -> Result<NodeKind> {
        match self.buf[KIND_OFFSET] {
            1 => Ok(NodeKind::Inner),
            2 => Ok(NodeKind::Leaf),
            tag => Err(Error::NodeInvariant(format!("unknown node type tag {}", tag)))
        }
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        read_u32(self.buf, COUNT_OFFSET) as usize
    }

    #[inline]
    pub(crate) fn next(&self) -> PageId {
        PageId::from_raw(read_u64(self.buf, NEXT_OFFSET))
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.count() >= self.layout.capacity
    }

    #[inline]
    pub(crate) fn key(&self, i: usize) -> K {
        let offset = self.layout.key_offset(i);
        K::read_from(&self.buf[offset..offset + self.layout.key_size])
    }

    #[inline]
    pub(crate) fn value(&self, i: usize) -> u64 {
        read_u64(self.buf, self.layout.value_offset(i))
    }

    #[inline]
    pub(crate) fn child(&self, i: usize) -> PageId {
        PageId::from_raw(self.value(i))
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        (0..self.count()).map(|i| self.key(i)).collect()
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = PageId> + '_ {
        (0..=self.count()).map(move |i| self.child(i))
    }

    /// Position of the first key not ordered before `key`, and whether it is equal to `key`.
    pub(crate) fn lower_bound<C: Comparator<K>>(&self, key: &K, cmp: &C) -> (usize, bool) {
        let count = self.count();
        for i in 0..count {
            match cmp.compare(&self.key(i), key) {
                Ordering::Less => continue,
                Ordering::Equal => return (i, true),
                Ordering::Greater => return (i, false)
            }
        }
        (count, false)
    }

    /// Index of the child whose subtree covers `key`; keys equal to a separator go right.
    pub(crate) fn child_index<C: Comparator<K>>(&self, key: &K, cmp: &C) -> usize {
        let count = self.count();
        (0..count)
            .find(|i| cmp.compare(key, &self.key(*i)) == Ordering::Less)
            .unwrap_or(count)
    }
}

/// Mutable view of a node page.
pub(crate) struct NodeMut<'a, K> {
    buf: &'a mut [u8],
    layout: &'a Layout,
    _key: PhantomData<K>
}

impl<'a, K: NodeKey> NodeMut<'a, K> {
    pub(crate) fn new(buf: &'a mut [u8], layout: &'a Layout) -> NodeMut<'a, K> {
        NodeMut {
            buf,
            layout,
            _key: PhantomData
        }
    }

    #[inline]
    pub(crate) fn view(&self) -> Node<'_, K> {
        Node::new(self.buf, self.layout)
    }

    /// Formats the page as an empty node of `kind` without a sibling.
    pub(crate) fn init(&mut self, kind: NodeKind) {
        self.buf[..HEADER_SIZE].iter_mut().for_each(|b| *b = 0);
        self.buf[KIND_OFFSET] = kind as u8;
        self.set_next(PageId::INVALID);
    }

    #[inline]
    pub(crate) fn set_count(&mut self, count: usize) {
        self.buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&(count as u32).to_le_bytes());
    }

    #[inline]
    pub(crate) fn set_next(&mut self, next: PageId) {
        self.buf[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&next.raw().to_le_bytes());
    }

    #[inline]
    pub(crate) fn set_key(&mut self, i: usize, key: &K) {
        let offset = self.layout.key_offset(i);
        key.write_to(&mut self.buf[offset..offset + self.layout.key_size]);
    }

    #[inline]
    pub(crate) fn set_value(&mut self, i: usize, value: u64) {
        let offset = self.layout.value_offset(i);
        self.buf[offset..offset + VALUE_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// Moves keys `[from, to)` by `delta` slots (positive is right).
    fn shift_keys(&mut self, from: usize, to: usize, delta: isize) {
        if from >= to {
            return;
        }
        let src = self.layout.key_offset(from)..self.layout.key_offset(to);
        let dst = (self.layout.key_offset(from) as isize + delta * self.layout.key_size as isize) as usize;
        self.buf.copy_within(src, dst);
    }

    fn shift_values(&mut self, from: usize, to: usize, delta: isize) {
        if from >= to {
            return;
        }
        let src = self.layout.value_offset(from)..self.layout.value_offset(to);
        let dst = (self.layout.value_offset(from) as isize + delta * VALUE_SIZE as isize) as usize;
        self.buf.copy_within(src, dst);
    }

    /// Inserts a leaf entry at `pos`, the node must have room.
    pub(crate) fn insert_entry(&mut self, pos: usize, key: &K, value: u64) -> Result<()> {
        let count = self.view().count();
        if count >= self.layout.capacity {
            return Err(Error::NodeInvariant(format!("insert into a full leaf of {} entries", count)));
        }
        self.shift_keys(pos, count, 1);
        self.shift_values(pos, count, 1);
        self.set_key(pos, key);
        self.set_value(pos, value);
        self.set_count(count + 1);
        Ok(())
    }

    /// Removes the leaf entry at `pos`.
    pub(crate) fn remove_entry(&mut self, pos: usize) {
        let count = self.view().count();
        self.shift_keys(pos + 1, count, -1);
        self.shift_values(pos + 1, count, -1);
        self.set_count(count - 1);
    }

    /// Inserts separator `key` at `pos` with `right` as the child following it.
    pub(crate) fn insert_separator(&mut self, pos: usize, key: &K, right: PageId) -> Result<()> {
        let count = self.view().count();
        if count >= self.layout.capacity {
            return Err(Error::NodeInvariant(format!("insert into a full inner node of {} keys", count)));
        }
        self.shift_keys(pos, count, 1);
        self.shift_values(pos + 1, count + 1, 1);
        self.set_key(pos, key);
        self.set_value(pos + 1, right.raw());
        self.set_count(count + 1);
        Ok(())
    }

    /// Moves the upper half of this full node into the empty page `right` (stored at
    /// `right_pid`) and returns the separator to insert into the parent.
    ///
    /// Leaves keep the larger half and copy the right node's first key up, inner nodes keep the
    /// smaller half and move their median key up.
    pub(crate) fn split_into(&mut self, right: &mut NodeMut<'_, K>, right_pid: PageId) -> Result<K> {
        let kind = self.view().kind()?;
        let count = self.view().count();
        right.init(kind);

        match kind {
            NodeKind::Leaf => {
                let keep = (count + 1) / 2;
                let moved = count - keep;
                for i in 0..moved {
                    right.set_key(i, &self.view().key(keep + i));
                    right.set_value(i, self.view().value(keep + i));
                }
                right.set_count(moved);
                right.set_next(self.view().next());
                self.set_count(keep);
                self.set_next(right_pid);
                Ok(right.view().key(0))
            }
            NodeKind::Inner => {
                let keep = count / 2;
                let separator = self.view().key(keep);
                let moved = count - keep - 1;
                for i in 0..moved {
                    right.set_key(i, &self.view().key(keep + 1 + i));
                }
                for i in 0..=moved {
                    right.set_value(i, self.view().value(keep + 1 + i));
                }
                right.set_count(moved);
                self.set_count(keep);
                Ok(separator)
            }
        }
    }

    /// Turns this page into an inner node with a single separator.
    pub(crate) fn make_root(&mut self, left: PageId, separator: &K, right: PageId) {
        self.init(NodeKind::Inner);
        self.set_key(0, separator);
        self.set_value(0, left.raw());
        self.set_value(1, right.raw());
        self.set_count(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{Layout, Node, NodeKind, NodeMut, HEADER_SIZE};
    use crate::btree::key::NaturalOrder;
    use crate::error::Error;
    use crate::ids::PageId;

    fn leaf(layout: &Layout, keys: &[u64]) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        {
            let mut node = NodeMut::<u64>::new(&mut buf, layout);
            node.init(NodeKind::Leaf);
            for (i, key) in keys.iter().enumerate() {
                node.insert_entry(i, key, key * 10).unwrap();
            }
        }
        buf
    }

    #[test]
    fn capacity_fits_page_or_clamp() {
        let layout = Layout::new::<u64>(512, None).unwrap();
        assert_eq!(layout.capacity(), (512 - HEADER_SIZE - 8) / 16);
        assert_eq!(Layout::new::<u64>(512, Some(4)).unwrap().capacity(), 4);
        assert_eq!(Layout::new::<u64>(512, Some(10_000)).unwrap().capacity(), layout.capacity());
        assert!(matches!(Layout::new::<u64>(512, Some(2)), Err(Error::InvalidConfig(_))));
        assert!(matches!(Layout::new::<[u8; 200]>(512, None), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unknown_tag_is_an_invariant_violation() {
        let layout = Layout::new::<u64>(512, None).unwrap();
        let buf = vec![0u8; 512];
        let node = Node::<u64>::new(&buf, &layout);
        assert!(matches!(node.kind(), Err(Error::NodeInvariant(_))));
    }

    #[test]
    fn leaf_entries_stay_sorted() {
        let layout = Layout::new::<u64>(512, Some(8)).unwrap();
        let mut buf = leaf(&layout, &[10, 30]);
        let mut node = NodeMut::<u64>::new(&mut buf, &layout);

        let (pos, found) = node.view().lower_bound(&20, &NaturalOrder);
        assert_eq!((pos, found), (1, false));
        node.insert_entry(pos, &20, 200).unwrap();
        assert_eq!(node.view().keys(), vec![10, 20, 30]);
        assert_eq!(node.view().value(1), 200);
        assert_eq!(node.view().value(2), 300);

        assert_eq!(node.view().lower_bound(&30, &NaturalOrder), (2, true));
        assert_eq!(node.view().lower_bound(&99, &NaturalOrder), (3, false));

        node.remove_entry(0);
        assert_eq!(node.view().keys(), vec![20, 30]);
        assert_eq!(node.view().value(0), 200);
        assert!(node.view().next() == PageId::INVALID);
    }

    #[test]
    fn full_leaf_rejects_insert() {
        let layout = Layout::new::<u64>(512, Some(4)).unwrap();
        let mut buf = leaf(&layout, &[1, 2, 3, 4]);
        let mut node = NodeMut::<u64>::new(&mut buf, &layout);
        assert!(node.view().is_full());
        assert!(matches!(node.insert_entry(0, &0, 0), Err(Error::NodeInvariant(_))));
    }

    #[test]
    fn leaf_split_copies_separator_up() {
        let layout = Layout::new::<u64>(512, Some(5)).unwrap();
        let mut left_buf = leaf(&layout, &[1, 2, 3, 4, 5]);
        let mut right_buf = vec![0u8; 512];
        let right_pid = PageId::new(0, 9);

        let mut left = NodeMut::<u64>::new(&mut left_buf, &layout);
        left.set_next(PageId::new(0, 3));
        let mut right = NodeMut::<u64>::new(&mut right_buf, &layout);
        let separator = left.split_into(&mut right, right_pid).unwrap();

        assert_eq!(separator, 4);
        assert_eq!(left.view().keys(), vec![1, 2, 3]);
        assert_eq!(right.view().keys(), vec![4, 5]);
        assert_eq!(right.view().value(1), 50);
        assert_eq!(left.view().next(), right_pid);
        assert_eq!(right.view().next(), PageId::new(0, 3));
        assert_eq!(right.view().kind().unwrap(), NodeKind::Leaf);
    }

    #[test]
    fn inner_split_moves_median_up() {
        let layout = Layout::new::<u64>(512, Some(4)).unwrap();
        let mut buf = vec![0u8; 512];
        let mut node = NodeMut::<u64>::new(&mut buf, &layout);
        node.make_root(PageId::new(0, 100), &10, PageId::new(0, 101));
        node.insert_separator(1, &20, PageId::new(0, 102)).unwrap();
        node.insert_separator(2, &30, PageId::new(0, 103)).unwrap();
        node.insert_separator(3, &40, PageId::new(0, 104)).unwrap();
        assert!(node.view().is_full());

        let mut right_buf = vec![0u8; 512];
        let mut right = NodeMut::<u64>::new(&mut right_buf, &layout);
        let separator = node.split_into(&mut right, PageId::new(0, 7)).unwrap();

        assert_eq!(separator, 30);
        assert_eq!(node.view().keys(), vec![10, 20]);
        assert_eq!(
            node.view().children().collect::<Vec<_>>(),
            vec![PageId::new(0, 100), PageId::new(0, 101), PageId::new(0, 102)]
        );
        assert_eq!(right.view().keys(), vec![40]);
        assert_eq!(
            right.view().children().collect::<Vec<_>>(),
            vec![PageId::new(0, 103), PageId::new(0, 104)]
        );
    }

    #[test]
    fn equal_keys_route_right() {
        let layout = Layout::new::<u64>(512, None).unwrap();
        let mut buf = vec![0u8; 512];
        let mut node = NodeMut::<u64>::new(&mut buf, &layout);
        node.make_root(PageId::new(0, 1), &50, PageId::new(0, 2));
        node.insert_separator(0, &20, PageId::new(0, 3)).unwrap();

        let view = node.view();
        assert_eq!(view.keys(), vec![20, 50]);
        assert_eq!(view.child_index(&5, &NaturalOrder), 0);
        assert_eq!(view.child_index(&20, &NaturalOrder), 1);
        assert_eq!(view.child_index(&49, &NaturalOrder), 1);
        assert_eq!(view.child_index(&50, &NaturalOrder), 2);
        assert_eq!(view.child(1), PageId::new(0, 3));
    }
}
