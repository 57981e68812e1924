//! Latched doubly linked list threaded through an external arena.
//!
//! Nodes are never owned by the list. They live in a slice owned by someone else (the page cache's
//! frame slots) and carry one [`Links`] per list they can be a member of. The list itself only
//! keeps the head, tail and length, so a node can be unlinked in O(1) from any position and the
//! same node can be a member of several lists at once.
//!
//! Handles are arena indices, [`NIL`] marks the absence of a neighbour. Mutations require the
//! list's exclusive latch, which is taken either by the convenience methods on
//! [`ConcurrentList`] or explicitly through [`ConcurrentList::lock`] when the caller has to do
//! several operations atomically. `first`, `last` and `len` can be read without latching, they are
//! only hints unless the caller holds a guard.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::latch::{ExclusiveGuard, Latch, SharedGuard};

/// Sentinel index meaning "no node".
pub const NIL: usize = usize::MAX;

/// Neighbour pointers embedded in an arena node.
#[derive(Debug)]
pub struct Links {
    next: AtomicUsize,
    prev: AtomicUsize
}

impl Links {
    pub fn new() -> Links {
        Links {
            next: AtomicUsize::new(NIL),
            prev: AtomicUsize::new(NIL)
        }
    }

    #[inline]
    pub fn next(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub fn prev(&self) -> usize {
        self.prev.load(Ordering::Acquire)
    }

    #[inline]
    fn set_next(&self, idx: usize) {
        self.next.store(idx, Ordering::Release)
    }

    #[inline]
    fn set_prev(&self, idx: usize) {
        self.prev.store(idx, Ordering::Release)
    }
}

impl Default for Links {
    fn default() -> Self {
        Links::new()
    }
}

/// Selects which [`Links`] of an arena node a list threads through.
pub trait Adapter {
    type Node;

    fn links(node: &Self::Node) -> &Links;
}

pub struct ConcurrentList<A: Adapter> {
    latch: Latch<()>,
    first: AtomicUsize,
    last: AtomicUsize,
    len: AtomicUsize,
    _adapter: PhantomData<fn(A)>
}

impl<A: Adapter> ConcurrentList<A> {
    pub fn new() -> ConcurrentList<A> {
        ConcurrentList {
            latch: Latch::new(()),
            first: AtomicUsize::new(NIL),
            last: AtomicUsize::new(NIL),
            len: AtomicUsize::new(0),
            _adapter: PhantomData
        }
    }

    #[inline]
    pub fn first(&self) -> usize {
        self.first.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last(&self) -> usize {
        self.last.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latches the list exclusively for a sequence of mutations.
    pub fn lock<'a>(&'a self, arena: &'a [A::Node]) -> ListGuard<'a, A> {
        ListGuard {
            list: self,
            arena,
            _latch: self.latch.exclusive()
        }
    }

    pub fn try_lock<'a>(&'a self, arena: &'a [A::Node]) -> Option<ListGuard<'a, A>> {
        Some(ListGuard {
            list: self,
            arena,
            _latch: self.latch.try_exclusive()?
        })
    }

    /// Latches the list in shared mode, for traversals only.
    pub fn read<'a>(&'a self, arena: &'a [A::Node]) -> ListReadGuard<'a, A> {
        ListReadGuard {
            list: self,
            arena,
            _latch: self.latch.shared()
        }
    }

    pub fn append(&self, arena: &[A::Node], idx: usize) {
        self.lock(arena).append(idx)
    }

    pub fn prepend(&self, arena: &[A::Node], idx: usize) {
        self.lock(arena).prepend(idx)
    }

    pub fn move_to_front(&self, arena: &[A::Node], idx: usize) {
        self.lock(arena).move_to_front(idx)
    }

    pub fn remove(&self, arena: &[A::Node], idx: usize) {
        self.lock(arena).remove(idx)
    }

    pub fn clear(&self, arena: &[A::Node]) -> Vec<usize> {
        self.lock(arena).clear()
    }
}

impl<A: Adapter> Default for ConcurrentList<A> {
    fn default() -> Self {
        ConcurrentList::new()
    }
}

impl<A: Adapter> std::fmt::Debug for ConcurrentList<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentList")
            .field("first", &self.first())
            .field("last", &self.last())
            .field("len", &self.len())
            .finish()
    }
}

/// Exclusive access to a [`ConcurrentList`].
pub struct ListGuard<'a, A: Adapter> {
    list: &'a ConcurrentList<A>,
    arena: &'a [A::Node],
    _latch: ExclusiveGuard<'a, ()>
}

impl<'a, A: Adapter> ListGuard<'a, A> {
    #[inline]
    fn links(&self, idx: usize) -> &'a Links {
        let arena: &'a [A::Node] = self.arena;
        A::links(&arena[idx])
    }

    #[inline]
    pub fn first(&self) -> usize {
        self.list.first()
    }

    #[inline]
    pub fn last(&self) -> usize {
        self.list.last()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn prev_of(&self, idx: usize) -> usize {
        self.links(idx).prev()
    }

    /// Links `idx`, which must not be a member, at the tail.
    pub fn append(&mut self, idx: usize) {
        let links = self.links(idx);
        let last = self.list.last();
        links.set_prev(last);
        links.set_next(NIL);
        if last == NIL {
            self.list.first.store(idx, Ordering::Release);
        } else {
            self.links(last).set_next(idx);
        }
        self.list.last.store(idx, Ordering::Release);
        self.list.len.fetch_add(1, Ordering::AcqRel);
    }

    /// Links `idx`, which must not be a member, at the head.
    pub fn prepend(&mut self, idx: usize) {
        let links = self.links(idx);
        let first = self.list.first();
        links.set_next(first);
        links.set_prev(NIL);
        if first == NIL {
            self.list.last.store(idx, Ordering::Release);
        } else {
            self.links(first).set_prev(idx);
        }
        self.list.first.store(idx, Ordering::Release);
        self.list.len.fetch_add(1, Ordering::AcqRel);
    }

    /// Unlinks member `idx`.
    pub fn remove(&mut self, idx: usize) {
        let links = self.links(idx);
        let prev = links.prev();
        let next = links.next();

        if prev == NIL {
            self.list.first.store(next, Ordering::Release);
        } else {
            self.links(prev).set_next(next);
        }

        if next == NIL {
            self.list.last.store(prev, Ordering::Release);
        } else {
            self.links(next).set_prev(prev);
        }

        links.set_next(NIL);
        links.set_prev(NIL);
        self.list.len.fetch_sub(1, Ordering::AcqRel);
    }

    /// Moves member `idx` to the head.
    pub fn move_to_front(&mut self, idx: usize) {
        if self.list.first() == idx {
            return;
        }
        self.remove(idx);
        self.prepend(idx);
    }

    /// Unlinks every member, returning them in list order.
    pub fn clear(&mut self) -> Vec<usize> {
        let mut removed = Vec::with_capacity(self.len());
        let mut cur = self.list.first();
        while cur != NIL {
            let links = self.links(cur);
            let next = links.next();
            links.set_next(NIL);
            links.set_prev(NIL);
            removed.push(cur);
            cur = next;
        }
        self.list.first.store(NIL, Ordering::Release);
        self.list.last.store(NIL, Ordering::Release);
        self.list.len.store(0, Ordering::Release);
        removed
    }

    pub fn iter(&self) -> Iter<'_, A> {
        Iter::forward(self.arena, self.list.first())
    }

    pub fn iter_rev(&self) -> Iter<'_, A> {
        Iter::backward(self.arena, self.list.last())
    }
}

/// Shared access to a [`ConcurrentList`], traversals only.
pub struct ListReadGuard<'a, A: Adapter> {
    list: &'a ConcurrentList<A>,
    arena: &'a [A::Node],
    _latch: SharedGuard<'a, ()>
}

impl<'a, A: Adapter> ListReadGuard<'a, A> {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, A> {
        Iter::forward(self.arena, self.list.first())
    }

    pub fn iter_rev(&self) -> Iter<'_, A> {
        Iter::backward(self.arena, self.list.last())
    }
}

pub struct Iter<'a, A: Adapter> {
    arena: &'a [A::Node],
    cur: usize,
    forward: bool
}

impl<'a, A: Adapter> Iter<'a, A> {
    fn forward(arena: &'a [A::Node], first: usize) -> Self {
        Iter { arena, cur: first, forward: true }
    }

    fn backward(arena: &'a [A::Node], last: usize) -> Self {
        Iter { arena, cur: last, forward: false }
    }
}

impl<'a, A: Adapter> Iterator for Iter<'a, A> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == NIL {
            return None;
        }
        let idx = self.cur;
        let links = A::links(&self.arena[idx]);
        self.cur = if self.forward { links.next() } else { links.prev() };
        Some(idx)
    }
}
