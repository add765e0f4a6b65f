//! Page-based B+ tree over the buffer pool.

use super::node::BTreeNode;
use shale_buffer::BufferPool;
use shale_common::page::{Page, PageId};
use shale_common::{validate_order, Result, ShaleError};
use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of inserting into a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertOutcome {
    /// The subtree root absorbed the entry.
    Unchanged,
    /// The subtree root split; the parent must add `separator` with
    /// `sibling` as the child to its right.
    Split { separator: i32, sibling: PageId },
}

/// Result of removing from a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoveOutcome {
    /// The key was not present.
    NotFound,
    /// The key was removed and the subtree root still holds enough keys.
    Stable,
    /// The key was removed and the subtree root fell below the minimum.
    Underflowed,
}

/// B+ tree mapping `i32` keys to `u64` record locators.
///
/// All data lives in leaves, which are chained left to right. Every node is
/// a page fetched through the [`BufferPool`] and pinned only for as long as
/// the operation touches it: at most three pages are pinned at once (a
/// parent and two children during a rebalance).
///
/// The root is held in memory. Callers persisting a tree (see the catalog)
/// must record [`root_page_id`](Self::root_page_id) after inserts and
/// removes, since splits and collapses move it.
pub struct BPlusTree {
    pool: Arc<BufferPool>,
    root: PageId,
    order: usize,
}

impl BPlusTree {
    /// Creates an empty tree. The root leaf is allocated on first insert.
    pub fn new(pool: Arc<BufferPool>, order: usize) -> Result<Self> {
        Self::open(pool, PageId::INVALID, order)
    }

    /// Attaches to an existing tree rooted at `root` without touching it.
    pub fn open(pool: Arc<BufferPool>, root: PageId, order: usize) -> Result<Self> {
        validate_order(order)?;
        Ok(Self { pool, root, order })
    }

    /// Returns the root page, INVALID for an empty tree.
    #[inline]
    pub fn root_page_id(&self) -> PageId {
        self.root
    }

    /// Returns true if the tree holds no keys.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.root.is_valid()
    }

    /// Returns the order (maximum keys per node).
    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Minimum keys for a non-root node: `ceil(order / 2) - 1`.
    #[inline]
    pub fn min_keys(&self) -> usize {
        self.order.div_ceil(2) - 1
    }

    /// Returns the buffer pool this tree reads through.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Returns the value stored for `key`.
    pub fn search(&self, key: i32) -> Result<Option<u64>> {
        if self.is_empty() {
            return Ok(None);
        }
        let leaf_id = self.find_leaf(key)?;
        let guard = self.pool.fetch_page(leaf_id)?;
        let leaf = self.node(guard.read());
        Ok(leaf.find_key_index(key).map(|idx| leaf.value_at(idx)))
    }

    /// Returns every entry in ascending key order.
    pub fn scan(&self) -> Result<Vec<(i32, u64)>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let first = self.leftmost_leaf()?;
        self.collect_leaves(first, i32::MIN, i32::MAX)
    }

    /// Returns the entries with `lo <= key <= hi` in ascending key order.
    pub fn range(&self, lo: i32, hi: i32) -> Result<Vec<(i32, u64)>> {
        if self.is_empty() || lo > hi {
            return Ok(Vec::new());
        }
        let first = self.find_leaf(lo)?;
        self.collect_leaves(first, lo, hi)
    }

    /// Returns the number of keys, counted along the leaf chain.
    pub fn len(&self) -> Result<usize> {
        Ok(self.scan()?.len())
    }

    /// Returns the number of levels, 0 for an empty tree.
    pub fn height(&self) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let mut height = 1;
        let mut current = self.root;
        loop {
            let guard = self.pool.fetch_page(current)?;
            let node = self.node(guard.read());
            check_node(&node)?;
            if node.is_leaf() {
                return Ok(height);
            }
            current = node.child_at(0);
            height += 1;
        }
    }

    /// Descends from the root to the leaf whose range covers `key`.
    fn find_leaf(&self, key: i32) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let guard = self.pool.fetch_page(current)?;
            let node = self.node(guard.read());
            check_node(&node)?;
            if node.is_leaf() {
                return Ok(current);
            }
            current = node.child_at(node.find_child_index(key));
        }
    }

    fn leftmost_leaf(&self) -> Result<PageId> {
        let mut current = self.root;
        loop {
            let guard = self.pool.fetch_page(current)?;
            let node = self.node(guard.read());
            check_node(&node)?;
            if node.is_leaf() {
                return Ok(current);
            }
            current = node.child_at(0);
        }
    }

    /// Follows the leaf chain from `first`, keeping keys in `[lo, hi]`.
    fn collect_leaves(&self, first: PageId, lo: i32, hi: i32) -> Result<Vec<(i32, u64)>> {
        let mut entries = Vec::new();
        let mut current = first;
        while current.is_valid() {
            let guard = self.pool.fetch_page(current)?;
            let leaf = self.node(guard.read());
            check_node(&leaf)?;
            for idx in 0..leaf.num_keys() {
                let key = leaf.key_at(idx);
                if key > hi {
                    return Ok(entries);
                }
                if key >= lo {
                    entries.push((key, leaf.value_at(idx)));
                }
            }
            current = leaf.next_leaf();
        }
        Ok(entries)
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Inserts `key` with `value`.
    ///
    /// Returns false and leaves the tree untouched if the key already exists.
    pub fn insert(&mut self, key: i32, value: u64) -> Result<bool> {
        if self.is_empty() {
            let guard = self.pool.new_page()?;
            let mut leaf = self.node(guard.write());
            leaf.init_leaf();
            leaf.insert_leaf_entry(0, key, value);
            self.root = guard.page_id();
            debug!(root = %self.root, "created root leaf");
            return Ok(true);
        }

        if self.search(key)?.is_some() {
            return Ok(false);
        }

        if let InsertOutcome::Split { separator, sibling } =
            self.insert_into(self.root, key, value)?
        {
            let old_root = self.root;
            let guard = self.pool.new_page()?;
            let mut root = self.node(guard.write());
            root.init_internal();
            root.set_child_at(0, old_root);
            root.insert_separator(0, separator, sibling);
            self.root = guard.page_id();
            debug!(old_root = %old_root, new_root = %self.root, separator, "root split");
        }
        Ok(true)
    }

    fn insert_into(&self, page_id: PageId, key: i32, value: u64) -> Result<InsertOutcome> {
        let guard = self.pool.fetch_page(page_id)?;
        let route = {
            let node = self.node(guard.read());
            check_node(&node)?;
            if node.is_leaf() {
                None
            } else {
                let idx = node.find_child_index(key);
                Some((idx, node.child_at(idx)))
            }
        };

        let Some((idx, child_id)) = route else {
            let mut leaf = self.node(guard.write());
            let pos = leaf.lower_bound(key);
            leaf.insert_leaf_entry(pos, key, value);
            trace!(page_id = %page_id, key, "inserted into leaf");
            if !leaf.is_overflowing() {
                return Ok(InsertOutcome::Unchanged);
            }
            return self.split_leaf(&mut leaf);
        };

        // The parent is not needed while the child is worked on.
        drop(guard);

        match self.insert_into(child_id, key, value)? {
            InsertOutcome::Unchanged => Ok(InsertOutcome::Unchanged),
            InsertOutcome::Split { separator, sibling } => {
                let guard = self.pool.fetch_page(page_id)?;
                let mut node = self.node(guard.write());
                node.insert_separator(idx, separator, sibling);
                if !node.is_overflowing() {
                    return Ok(InsertOutcome::Unchanged);
                }
                self.split_internal(&mut node)
            }
        }
    }

    /// Moves the upper half of an overflowing leaf into a new right sibling.
    fn split_leaf<P>(&self, leaf: &mut BTreeNode<P>) -> Result<InsertOutcome>
    where
        P: DerefMut<Target = Page>,
    {
        let total = leaf.num_keys();
        let mid = total / 2;

        let sibling_guard = self.pool.new_page()?;
        let sibling_id = sibling_guard.page_id();
        let mut sibling = self.node(sibling_guard.write());
        sibling.init_leaf();
        for (pos, idx) in (mid..total).enumerate() {
            sibling.insert_leaf_entry(pos, leaf.key_at(idx), leaf.value_at(idx));
        }
        sibling.set_next_leaf(leaf.next_leaf());
        leaf.set_next_leaf(sibling_id);
        leaf.set_num_keys(mid);

        let separator = sibling.key_at(0);
        debug!(
            page_id = %leaf.page_id(),
            sibling = %sibling_id,
            separator,
            "split leaf"
        );
        Ok(InsertOutcome::Split {
            separator,
            sibling: sibling_id,
        })
    }

    /// Moves the keys after the middle one into a new right sibling and
    /// promotes the middle key.
    fn split_internal<P>(&self, node: &mut BTreeNode<P>) -> Result<InsertOutcome>
    where
        P: DerefMut<Target = Page>,
    {
        let total = node.num_keys();
        let mid = total / 2;
        let separator = node.key_at(mid);

        let sibling_guard = self.pool.new_page()?;
        let sibling_id = sibling_guard.page_id();
        let mut sibling = self.node(sibling_guard.write());
        sibling.init_internal();
        sibling.set_child_at(0, node.child_at(mid + 1));
        for idx in mid + 1..total {
            let pos = sibling.num_keys();
            sibling.insert_separator(pos, node.key_at(idx), node.child_at(idx + 1));
        }
        node.set_num_keys(mid);

        debug!(
            page_id = %node.page_id(),
            sibling = %sibling_id,
            separator,
            "split internal node"
        );
        Ok(InsertOutcome::Split {
            separator,
            sibling: sibling_id,
        })
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Overwrites the value for an existing key.
    ///
    /// Returns false if the key is absent.
    pub fn update(&mut self, key: i32, value: u64) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        let leaf_id = self.find_leaf(key)?;
        let guard = self.pool.fetch_page(leaf_id)?;
        let Some(idx) = self.node(guard.read()).find_key_index(key) else {
            return Ok(false);
        };
        self.node(guard.write()).set_value_at(idx, value);
        trace!(page_id = %leaf_id, key, "updated value");
        Ok(true)
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes `key`.
    ///
    /// Returns false if the key is absent.
    pub fn remove(&mut self, key: i32) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        // The root is exempt from the minimum, so its underflow is ignored
        // here and only an empty root is acted on.
        if self.remove_from(self.root, key)? == RemoveOutcome::NotFound {
            return Ok(false);
        }
        self.collapse_root()?;
        Ok(true)
    }

    fn remove_from(&self, page_id: PageId, key: i32) -> Result<RemoveOutcome> {
        let guard = self.pool.fetch_page(page_id)?;
        let (idx, child_id) = {
            let node = self.node(guard.read());
            check_node(&node)?;
            if node.is_leaf() {
                let Some(idx) = node.find_key_index(key) else {
                    return Ok(RemoveOutcome::NotFound);
                };
                drop(node);
                let mut leaf = self.node(guard.write());
                leaf.remove_leaf_entry(idx);
                trace!(page_id = %page_id, key, "removed from leaf");
                return Ok(self.outcome_for(leaf.num_keys()));
            }
            let idx = node.find_child_index(key);
            (idx, node.child_at(idx))
        };
        drop(guard);

        match self.remove_from(child_id, key)? {
            RemoveOutcome::Underflowed => {
                self.rebalance(page_id, idx)?;
                let guard = self.pool.fetch_page(page_id)?;
                let num_keys = self.node(guard.read()).num_keys();
                Ok(self.outcome_for(num_keys))
            }
            outcome => Ok(outcome),
        }
    }

    fn outcome_for(&self, num_keys: usize) -> RemoveOutcome {
        if num_keys < self.min_keys() {
            RemoveOutcome::Underflowed
        } else {
            RemoveOutcome::Stable
        }
    }

    /// Restores the minimum in child `idx` of `parent_id` by borrowing from a
    /// sibling with a surplus (left first) or merging with one.
    fn rebalance(&self, parent_id: PageId, idx: usize) -> Result<()> {
        let parent_guard = self.pool.fetch_page(parent_id)?;
        let (child_id, left_id, right_id) = {
            let parent = self.node(parent_guard.read());
            let n = parent.num_keys();
            (
                parent.child_at(idx),
                (idx > 0).then(|| parent.child_at(idx - 1)),
                (idx < n).then(|| parent.child_at(idx + 1)),
            )
        };
        let min = self.min_keys();

        if let Some(left_id) = left_id {
            let left_guard = self.pool.fetch_page(left_id)?;
            if self.node(left_guard.read()).num_keys() > min {
                let child_guard = self.pool.fetch_page(child_id)?;
                let mut parent = self.node(parent_guard.write());
                let mut left = self.node(left_guard.write());
                let mut child = self.node(child_guard.write());
                borrow_from_left(&mut parent, idx, &mut left, &mut child);
                debug!(page_id = %child_id, sibling = %left_id, "borrowed from left sibling");
                return Ok(());
            }
        }

        if let Some(right_id) = right_id {
            let right_guard = self.pool.fetch_page(right_id)?;
            if self.node(right_guard.read()).num_keys() > min {
                let child_guard = self.pool.fetch_page(child_id)?;
                let mut parent = self.node(parent_guard.write());
                let mut child = self.node(child_guard.write());
                let mut right = self.node(right_guard.write());
                borrow_from_right(&mut parent, idx, &mut child, &mut right);
                debug!(page_id = %child_id, sibling = %right_id, "borrowed from right sibling");
                return Ok(());
            }
        }

        // Merge the pair into its left page: (left, child) if there is a left
        // sibling, otherwise (child, right).
        let (sep_idx, keep_id, absorb_id) = match (left_id, right_id) {
            (Some(left_id), _) => (idx - 1, left_id, child_id),
            (None, Some(right_id)) => (idx, child_id, right_id),
            (None, None) => {
                return Err(ShaleError::BTreeCorrupted(format!(
                    "internal page {parent_id} has a single child"
                )))
            }
        };

        {
            let keep_guard = self.pool.fetch_page(keep_id)?;
            let absorb_guard = self.pool.fetch_page(absorb_id)?;
            let mut parent = self.node(parent_guard.write());
            let mut keep = self.node(keep_guard.write());
            let absorb = self.node(absorb_guard.read());
            merge_into(&mut parent, sep_idx, &mut keep, &absorb);
        }
        drop(parent_guard);

        self.pool.free_page(absorb_id)?;
        debug!(page_id = %keep_id, absorbed = %absorb_id, "merged nodes");
        Ok(())
    }

    /// Replaces a root left with no keys by its only child, or empties the
    /// tree when that root is a leaf.
    fn collapse_root(&mut self) -> Result<()> {
        let old_root = self.root;
        let new_root = {
            let guard = self.pool.fetch_page(old_root)?;
            let root = self.node(guard.read());
            if root.num_keys() > 0 {
                return Ok(());
            }
            if root.is_leaf() {
                PageId::INVALID
            } else {
                root.child_at(0)
            }
        };

        self.pool.free_page(old_root)?;
        self.root = new_root;
        debug!(old_root = %old_root, new_root = %new_root, "collapsed root");
        Ok(())
    }

    // =========================================================================
    // Debugging
    // =========================================================================

    /// Renders the tree one node per line, children indented under parents.
    pub fn dump(&self) -> Result<String> {
        let mut out = String::new();
        if self.is_empty() {
            out.push_str("(empty)\n");
        } else {
            self.dump_node(self.root, 0, &mut out)?;
        }
        Ok(out)
    }

    /// Prints [`dump`](Self::dump) to stdout.
    pub fn print(&self) -> Result<()> {
        print!("{}", self.dump()?);
        Ok(())
    }

    fn dump_node(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        let children = {
            let guard = self.pool.fetch_page(page_id)?;
            let node = self.node(guard.read());
            check_node(&node)?;
            let _ = writeln!(out, "{:indent$}{}", "", node.describe(), indent = depth * 2);
            if node.is_leaf() {
                Vec::new()
            } else {
                node.children()
            }
        };
        for child in children {
            self.dump_node(child, depth + 1, out)?;
        }
        Ok(())
    }

    /// Checks every structural invariant and reports the first violation.
    ///
    /// Checked: node types and key counts, strictly ascending keys, keys
    /// within the bounds set by ancestor separators, uniform leaf depth, and
    /// a leaf chain that visits every leaf in order.
    pub fn verify(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut walk = VerifyWalk::default();
        self.verify_node(self.root, None, None, 0, &mut walk)?;

        let mut current = walk.leaves.first().copied().unwrap_or(PageId::INVALID);
        let mut chain = Vec::with_capacity(walk.leaves.len());
        let mut last_key: Option<i32> = None;
        while current.is_valid() {
            if chain.len() == walk.leaves.len() {
                return Err(corrupted(format!("leaf chain runs past leaf {current}")));
            }
            chain.push(current);
            let guard = self.pool.fetch_page(current)?;
            let leaf = self.node(guard.read());
            check_node(&leaf)?;
            for key in leaf.keys() {
                if last_key.is_some_and(|last| last >= key) {
                    return Err(corrupted(format!("leaf chain not ascending at key {key}")));
                }
                last_key = Some(key);
            }
            current = leaf.next_leaf();
        }
        if chain != walk.leaves {
            return Err(corrupted(format!(
                "leaf chain {chain:?} does not match tree order {:?}",
                walk.leaves
            )));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        page_id: PageId,
        lower: Option<i32>,
        upper: Option<i32>,
        depth: usize,
        walk: &mut VerifyWalk,
    ) -> Result<()> {
        let is_root = depth == 0;
        let (keys, children) = {
            let guard = self.pool.fetch_page(page_id)?;
            let node = self.node(guard.read());
            check_node(&node)?;
            let children = if node.is_leaf() {
                Vec::new()
            } else {
                node.children()
            };
            (node.keys(), children)
        };

        let n = keys.len();
        if n > self.order {
            return Err(corrupted(format!("page {page_id} holds {n} keys, order is {}", self.order)));
        }
        if is_root && n == 0 {
            return Err(corrupted(format!("root {page_id} has no keys")));
        }
        if !is_root && n < self.min_keys() {
            return Err(corrupted(format!(
                "page {page_id} holds {n} keys, minimum is {}",
                self.min_keys()
            )));
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(corrupted(format!("page {page_id} keys not ascending: {keys:?}")));
        }
        for &key in &keys {
            if lower.is_some_and(|lo| key < lo) || upper.is_some_and(|hi| key >= hi) {
                return Err(corrupted(format!(
                    "page {page_id} key {key} outside [{lower:?}, {upper:?})"
                )));
            }
        }

        if children.is_empty() {
            match walk.leaf_depth {
                Some(d) if d != depth => {
                    return Err(corrupted(format!(
                        "leaf {page_id} at depth {depth}, expected {d}"
                    )));
                }
                _ => walk.leaf_depth = Some(depth),
            }
            walk.leaves.push(page_id);
            return Ok(());
        }

        for (i, &child) in children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(keys[i - 1]) };
            let hi = if i == n { upper } else { Some(keys[i]) };
            self.verify_node(child, lo, hi, depth + 1, walk)?;
        }
        Ok(())
    }

    #[inline]
    fn node<P: Deref<Target = Page>>(&self, page: P) -> BTreeNode<P> {
        BTreeNode::new(page, self.order)
    }
}

impl std::fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("root", &self.root)
            .field("order", &self.order)
            .finish()
    }
}

/// State gathered by [`BPlusTree::verify`].
#[derive(Default)]
struct VerifyWalk {
    leaf_depth: Option<usize>,
    leaves: Vec<PageId>,
}

fn corrupted(reason: String) -> ShaleError {
    ShaleError::BTreeCorrupted(reason)
}

/// Rejects pages that are not tree nodes of the order they are read with.
fn check_node<P: Deref<Target = Page>>(node: &BTreeNode<P>) -> Result<()> {
    if !node.is_leaf() && !node.is_internal() {
        return Err(corrupted(format!(
            "page {} is not a tree node",
            node.page_id()
        )));
    }
    if node.stored_order() != node.order() {
        return Err(corrupted(format!(
            "page {} was written with order {}, read with order {}",
            node.page_id(),
            node.stored_order(),
            node.order()
        )));
    }
    if node.num_keys() > node.capacity() {
        return Err(corrupted(format!(
            "page {} holds {} keys, capacity is {}",
            node.page_id(),
            node.num_keys(),
            node.capacity()
        )));
    }
    Ok(())
}

/// Moves the last entry of `left` into the front of child `idx`.
fn borrow_from_left<P, L, C>(
    parent: &mut BTreeNode<P>,
    idx: usize,
    left: &mut BTreeNode<L>,
    child: &mut BTreeNode<C>,
) where
    P: DerefMut<Target = Page>,
    L: DerefMut<Target = Page>,
    C: DerefMut<Target = Page>,
{
    let last = left.num_keys() - 1;
    if child.is_leaf() {
        let (key, value) = left.remove_leaf_entry(last);
        child.insert_leaf_entry(0, key, value);
        parent.set_key_at(idx - 1, key);
    } else {
        // Rotate through the parent: its separator comes down in front of
        // the child and the left sibling's last key replaces it.
        let (key, moved) = left.remove_separator(last);
        child.push_front(moved, parent.key_at(idx - 1));
        parent.set_key_at(idx - 1, key);
    }
}

/// Moves the first entry of `right` onto the end of child `idx`.
fn borrow_from_right<P, C, R>(
    parent: &mut BTreeNode<P>,
    idx: usize,
    child: &mut BTreeNode<C>,
    right: &mut BTreeNode<R>,
) where
    P: DerefMut<Target = Page>,
    C: DerefMut<Target = Page>,
    R: DerefMut<Target = Page>,
{
    let end = child.num_keys();
    if child.is_leaf() {
        let (key, value) = right.remove_leaf_entry(0);
        child.insert_leaf_entry(end, key, value);
        parent.set_key_at(idx, right.key_at(0));
    } else {
        let (moved, key) = right.pop_front();
        child.insert_separator(end, parent.key_at(idx), moved);
        parent.set_key_at(idx, key);
    }
}

/// Appends `right` to `left` and drops separator `sep_idx` and the pointer
/// to `right` from the parent.
fn merge_into<P, L, R>(
    parent: &mut BTreeNode<P>,
    sep_idx: usize,
    left: &mut BTreeNode<L>,
    right: &BTreeNode<R>,
) where
    P: DerefMut<Target = Page>,
    L: DerefMut<Target = Page>,
    R: Deref<Target = Page>,
{
    if left.is_leaf() {
        for idx in 0..right.num_keys() {
            let end = left.num_keys();
            left.insert_leaf_entry(end, right.key_at(idx), right.value_at(idx));
        }
        left.set_next_leaf(right.next_leaf());
    } else {
        let end = left.num_keys();
        left.insert_separator(end, parent.key_at(sep_idx), right.child_at(0));
        for idx in 0..right.num_keys() {
            let end = left.num_keys();
            left.insert_separator(end, right.key_at(idx), right.child_at(idx + 1));
        }
    }
    parent.remove_separator(sep_idx);
}
