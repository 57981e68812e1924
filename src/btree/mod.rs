//! B+ Tree index stored in cache pages.
//!
//! Every node is one page of a [`Segment`]. The root always lives on the first page of the
//! segment, so the tree needs no latch of its own: growing the tree moves both halves of the old
//! root to fresh pages and rewrites the root in place as an inner node.
//!
//! Readers descend with shared latch coupling, writers with exclusive latch coupling, and full
//! nodes are split on the way down so a split never has to propagate back up. Erasing never
//! merges nodes, leaves may become underfull or empty.
//!
//! Leaves map keys to [`TupleId`]s and are chained left to right for range scans.

use smallvec::{smallvec, SmallVec};

use std::cmp::Ordering;
use std::io::Write;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::bufmgr::{PageCache, PageGuard};
use crate::error::{Error, Result};
use crate::ids::{PageId, TupleId};
use crate::segment::Segment;

mod key;
mod node;

pub use key::{Comparator, NaturalOrder, NodeKey};
pub use node::NodeKind;

use node::{Layout, Node, NodeMut};

pub struct BTree<K: NodeKey, C: Comparator<K> = NaturalOrder> {
    cache: Arc<PageCache>,
    segment: Segment,
    root: PageId,
    layout: Layout,
    size: AtomicU64,
    cmp: C,
    _key: PhantomData<fn() -> K>
}

impl<K: NodeKey + Ord> BTree<K, NaturalOrder> {
    /// Creates an empty tree in `segment`, which must not hold any page yet.
    pub fn create(cache: Arc<PageCache>, segment: Segment) -> Result<Self> {
        BTree::create_with(cache, segment, None, NaturalOrder)
    }

    /// Reopens the tree rooted at the first page of `segment`.
    pub fn open(cache: Arc<PageCache>, segment: Segment) -> Result<Self> {
        BTree::open_with(cache, segment, None, NaturalOrder)
    }
}

impl<K: NodeKey, C: Comparator<K>> BTree<K, C> {
    /// Creates an empty tree ordered by `cmp`. `max_entries` caps the entries per node below what
    /// a page could hold.
    pub fn create_with(cache: Arc<PageCache>, segment: Segment, max_entries: Option<usize>, cmp: C) -> Result<Self> {
        let layout = Layout::new::<K>(cache.page_size(), max_entries)?;
        if segment.page_count() != 0 {
            return Err(Error::InvalidConfig(format!(
                "segment {} already holds {} pages",
                segment.id(),
                segment.page_count()
            )));
        }

        let root = segment.add_page();
        {
            let mut guard = cache.fix(root, true)?;
            NodeMut::<K>::new(guard.data_mut(), &layout).init(NodeKind::Leaf);
            cache.unfix(guard, true);
        }

        log::debug!("created tree in segment {} with {} entries per node", segment.id(), layout.capacity());

        Ok(BTree {
            cache,
            segment,
            root,
            layout,
            size: AtomicU64::new(0),
            cmp,
            _key: PhantomData
        })
    }

    /// Reopens a tree ordered by `cmp`; `max_entries` must match the value it was created with.
    pub fn open_with(cache: Arc<PageCache>, segment: Segment, max_entries: Option<usize>, cmp: C) -> Result<Self> {
        let layout = Layout::new::<K>(cache.page_size(), max_entries)?;
        if segment.page_count() == 0 {
            return Err(Error::NodeInvariant(format!("segment {} has no root page", segment.id())));
        }

        let tree = BTree {
            cache,
            root: segment.page(0),
            segment,
            layout,
            size: AtomicU64::new(0),
            cmp,
            _key: PhantomData
        };

        let mut size = 0u64;
        tree.walk_leaves(|leaf| {
            size += leaf.count() as u64;
            Ok(())
        })?;
        tree.size.store(size, AtomicOrdering::Release);

        log::debug!("opened tree in segment {} holding {} keys", tree.segment.id(), size);
        Ok(tree)
    }

    #[inline]
    fn view<'g>(&'g self, guard: &'g PageGuard<'_>) -> Node<'g, K> {
        Node::new(guard.data(), &self.layout)
    }

    #[inline]
    fn view_mut<'g>(&'g self, guard: &'g mut PageGuard<'_>) -> NodeMut<'g, K> {
        NodeMut::new(guard.data_mut(), &self.layout)
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Maximum number of entries per node.
    pub fn node_capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Number of keys in the tree.
    pub fn size(&self) -> u64 {
        self.size.load(AtomicOrdering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Descends to the leaf that covers `key`, holding at most two pages shared at a time.
    fn find_leaf(&self, key: &K) -> Result<PageGuard<'_>> {
        let mut node = self.cache.fix(self.root, false)?;
        loop {
            let view = self.view(&node);
            match view.kind()? {
                NodeKind::Leaf => return Ok(node),
                NodeKind::Inner => {
                    let child = view.child(view.child_index(key, &self.cmp));
                    let child = self.cache.fix(child, false)?;
                    node = child;
                }
            }
        }
    }

    pub fn lookup(&self, key: &K) -> Result<Option<TupleId>> {
        let leaf = self.find_leaf(key)?;
        let view = self.view(&leaf);
        let (pos, found) = view.lower_bound(key, &self.cmp);
        Ok(if found {
            Some(TupleId::from_raw(view.value(pos)))
        } else {
            None
        })
    }

    /// Values of all keys in `[from, to]`, in key order.
    pub fn lookup_range(&self, from: &K, to: &K) -> Result<Vec<TupleId>> {
        let mut found = vec![];
        if self.cmp.compare(from, to) == Ordering::Greater {
            return Ok(found);
        }

        let mut leaf = self.find_leaf(from)?;
        let mut pos = self.view(&leaf).lower_bound(from, &self.cmp).0;
        loop {
            let view = self.view(&leaf);
            while pos < view.count() {
                if self.cmp.compare(&view.key(pos), to) == Ordering::Greater {
                    return Ok(found);
                }
                found.push(TupleId::from_raw(view.value(pos)));
                pos += 1;
            }

            let next = view.next();
            if !next.is_valid() {
                return Ok(found);
            }
            let next = self.cache.fix(next, false)?;
            leaf = next;
            pos = 0;
        }
    }

    /// Inserts `key`, returns `false` without touching the tree if it is already present.
    pub fn insert(&self, key: K, tid: TupleId) -> Result<bool> {
        let mut node = self.cache.fix(self.root, true)?;
        let mut dirty = false;
        if self.view(&node).is_full() {
            self.split_root(&mut node)?;
            dirty = true;
        }

        loop {
            let kind = self.view(&node).kind()?;
            match kind {
                NodeKind::Leaf => {
                    let (pos, found) = self.view(&node).lower_bound(&key, &self.cmp);
                    if found {
                        self.cache.unfix(node, dirty);
                        return Ok(false);
                    }
                    self.view_mut(&mut node).insert_entry(pos, &key, tid.raw())?;
                    self.cache.unfix(node, true);
                    self.size.fetch_add(1, AtomicOrdering::AcqRel);
                    return Ok(true);
                }
                NodeKind::Inner => {
                    let idx = self.view(&node).child_index(&key, &self.cmp);
                    let child_pid = self.view(&node).child(idx);
                    let mut child = self.cache.fix(child_pid, true)?;
                    let mut child_dirty = false;

                    if self.view(&child).is_full() {
                        let (separator, right) = self.split(&mut child)?;
                        self.view_mut(&mut node).insert_separator(idx, &separator, right.pid())?;
                        dirty = true;
                        child_dirty = true;

                        if self.cmp.compare(&key, &separator) == Ordering::Less {
                            self.cache.unfix(right, true);
                        } else {
                            self.cache.unfix(child, true);
                            child = right;
                        }
                    }

                    self.cache.unfix(node, dirty);
                    node = child;
                    dirty = child_dirty;
                }
            }
        }
    }

    /// Moves the upper half of the full node behind `guard` to a new page, returned latched
    /// exclusively, together with the separator for the parent.
    fn split<'c>(&'c self, guard: &mut PageGuard<'c>) -> Result<(K, PageGuard<'c>)> {
        let right_pid = self.segment.add_page();
        let mut right = self.cache.fix(right_pid, true)?;

        let separator = {
            let mut left = NodeMut::<K>::new(guard.data_mut(), &self.layout);
            let mut new = NodeMut::<K>::new(right.data_mut(), &self.layout);
            left.split_into(&mut new, right_pid)?
        };

        guard.mark_dirty();
        right.mark_dirty();
        log::debug!("split page {} into {} at {:?}", guard.pid(), right_pid, separator);
        Ok((separator, right))
    }

    /// Grows the tree by one level, keeping the root on its page.
    fn split_root(&self, root: &mut PageGuard<'_>) -> Result<()> {
        let left_pid = self.segment.add_page();
        let mut left = self.cache.fix(left_pid, true)?;
        left.data_mut().copy_from_slice(root.data());

        let (separator, right) = self.split(&mut left)?;
        let right_pid = right.pid();
        self.view_mut(root).make_root(left_pid, &separator, right_pid);

        self.cache.unfix(left, true);
        self.cache.unfix(right, true);
        log::debug!("grew root {} over {} and {}", self.root, left_pid, right_pid);
        Ok(())
    }

    /// Removes `key`, returns `false` if it was not present.
    pub fn erase(&self, key: &K) -> Result<bool> {
        let mut node = self.cache.fix(self.root, true)?;
        loop {
            let kind = self.view(&node).kind()?;
            match kind {
                NodeKind::Leaf => {
                    let (pos, found) = self.view(&node).lower_bound(key, &self.cmp);
                    if !found {
                        self.cache.unfix(node, false);
                        return Ok(false);
                    }
                    self.view_mut(&mut node).remove_entry(pos);
                    self.cache.unfix(node, true);
                    self.size.fetch_sub(1, AtomicOrdering::AcqRel);
                    return Ok(true);
                }
                NodeKind::Inner => {
                    let child = self.view(&node).child(self.view(&node).child_index(key, &self.cmp));
                    let child = self.cache.fix(child, true)?;
                    node = child;
                }
            }
        }
    }

    fn leftmost_leaf(&self) -> Result<(PageGuard<'_>, usize)> {
        let mut node = self.cache.fix(self.root, false)?;
        let mut height = 1;
        loop {
            let view = self.view(&node);
            match view.kind()? {
                NodeKind::Leaf => return Ok((node, height)),
                NodeKind::Inner => {
                    let child = self.cache.fix(view.child(0), false)?;
                    node = child;
                    height += 1;
                }
            }
        }
    }

    fn walk_leaves<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Node<'_, K>) -> Result<()>
    {
        let (mut leaf, _) = self.leftmost_leaf()?;
        loop {
            let view = self.view(&leaf);
            f(&view)?;
            let next = view.next();
            if !next.is_valid() {
                return Ok(());
            }
            let next = self.cache.fix(next, false)?;
            leaf = next;
        }
    }

    /// Number of levels, a lone root leaf has height one.
    pub fn height(&self) -> Result<usize> {
        Ok(self.leftmost_leaf()?.1)
    }

    /// Every key in leaf chain order.
    pub fn leaf_keys(&self) -> Result<Vec<K>> {
        let mut keys = vec![];
        self.walk_leaves(|leaf| {
            keys.extend(leaf.keys());
            Ok(())
        })?;
        Ok(keys)
    }

    /// Checks the structure of a quiescent tree: sorted nodes, separators bounding their
    /// subtrees (everything left of `s` is smaller, everything right is at least `s`) and all
    /// leaves at the same depth.
    pub fn verify(&self) -> Result<()> {
        let mut leaf_depth = None;
        self.verify_node(self.root, None, None, 1, &mut leaf_depth)
    }

    fn verify_node(
        &self,
        pid: PageId,
        lower: Option<K>,
        upper: Option<K>,
        depth: usize,
        leaf_depth: &mut Option<usize>
    ) -> Result<()> {
        let (kind, keys, children) = {
            let guard = self.cache.fix(pid, false)?;
            let view = self.view(&guard);
            let kind = view.kind()?;
            let children: Vec<PageId> = match kind {
                NodeKind::Inner => view.children().collect(),
                NodeKind::Leaf => vec![]
            };
            (kind, view.keys(), children)
        };

        let violation = |what: String| Err(Error::NodeInvariant(format!("page {}: {}", pid, what)));

        for pair in keys.windows(2) {
            if self.cmp.compare(&pair[0], &pair[1]) != Ordering::Less {
                return violation(format!("keys {:?} and {:?} out of order", pair[0], pair[1]));
            }
        }

        for key in keys.iter() {
            if let Some(lower) = lower.as_ref() {
                if self.cmp.compare(key, lower) == Ordering::Less {
                    return violation(format!("key {:?} below separator {:?}", key, lower));
                }
            }
            if let Some(upper) = upper.as_ref() {
                if self.cmp.compare(key, upper) != Ordering::Less {
                    return violation(format!("key {:?} not below separator {:?}", key, upper));
                }
            }
        }

        match kind {
            NodeKind::Leaf => match *leaf_depth {
                Some(expected) if expected != depth => {
                    violation(format!("leaf at depth {} while others are at {}", depth, expected))
                }
                _ => {
                    *leaf_depth = Some(depth);
                    Ok(())
                }
            },
            NodeKind::Inner => {
                if keys.is_empty() {
                    return violation("inner node without separators".to_string());
                }
                for (i, child) in children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(keys[i - 1]) };
                    let hi = if i == keys.len() { upper } else { Some(keys[i]) };
                    self.verify_node(*child, lo, hi, depth + 1, leaf_depth)?;
                }
                Ok(())
            }
        }
    }

    /// Renders the tree in GraphViz DOT, one record per page, solid edges to children and dashed
    /// edges to leaf siblings. Pages are latched one at a time, concurrent writers may produce
    /// an inconsistent picture.
    pub fn to_dot<W: Write>(&self, out: &mut W) -> Result<()> {
        fn name(pid: PageId) -> String {
            format!("page{}_{}", pid.segment(), pid.page())
        }

        fn escape(text: String) -> String {
            let mut escaped = String::with_capacity(text.len());
            for c in text.chars() {
                if matches!(c, '{' | '}' | '|' | '<' | '>' | '"' | '\\') {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
            escaped
        }

        writeln!(out, "digraph btree {{")?;
        writeln!(out, "  node [shape=record];")?;

        let mut pending: SmallVec<[PageId; 16]> = smallvec![self.root];
        while let Some(pid) = pending.pop() {
            let guard = self.cache.fix(pid, false)?;
            let view = self.view(&guard);
            match view.kind()? {
                NodeKind::Leaf => {
                    let label = if view.count() == 0 {
                        "(empty)".to_string()
                    } else {
                        view.keys()
                            .into_iter()
                            .map(|key| escape(format!("{:?}", key)))
                            .collect::<Vec<_>>()
                            .join("|")
                    };
                    writeln!(out, "  {} [label=\"{}\"];", name(pid), label)?;
                    if view.next().is_valid() {
                        writeln!(out, "  {} -> {} [style=dashed];", name(pid), name(view.next()))?;
                    }
                }
                NodeKind::Inner => {
                    let mut label = String::from("<c0>");
                    for (i, key) in view.keys().into_iter().enumerate() {
                        label.push_str(&format!("|{}|<c{}>", escape(format!("{:?}", key)), i + 1));
                    }
                    writeln!(out, "  {} [label=\"{}\"];", name(pid), label)?;

                    let children: SmallVec<[PageId; 16]> = view.children().collect();
                    for (i, child) in children.iter().enumerate() {
                        writeln!(out, "  {}:c{} -> {};", name(pid), i, name(*child))?;
                    }
                    pending.extend(children.into_iter().rev());
                }
            }
        }

        writeln!(out, "}}")?;
        Ok(())
    }
}

impl<K: NodeKey, C: Comparator<K>> std::fmt::Debug for BTree<K, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("segment", &self.segment.id())
            .field("root", &self.root)
            .field("node_capacity", &self.layout.capacity())
            .field("size", &self.size())
            .finish()
    }
}
