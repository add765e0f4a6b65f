//! B+ tree node view over a page payload.
//!
//! Payload layout (offsets relative to the payload start):
//!
//! ```text
//! Leaf:                                Internal:
//! +----------------------+ 0           +----------------------+ 0
//! | num_keys: u16        |             | num_keys: u16        |
//! | order: u16           |             | order: u16           |
//! | next_leaf: u32       |             +----------------------+ 4
//! +----------------------+ 8           | keys: i32 * cap      |
//! | keys: i32 * cap      |             +----------------------+
//! +----------------------+             | children: u64 *      |
//! | values: u64 * cap    |             |         (cap + 1)    |
//! +----------------------+             +----------------------+
//! ```
//!
//! `order` is stamped when the page is formatted so a reader with a different
//! order can detect the mismatch instead of decoding the wrong offsets.
//! `cap` is `order + 1`: a node may hold one key past its order between an
//! insert and the split that follows it. Index arguments are checked against
//! the live entry count and the capacity; a bad index or a leaf-only call on
//! an internal node (or the reverse) is a bug in the caller and panics.

use shale_common::config::{INTERNAL_NODE_HEADER_SIZE, LEAF_NODE_HEADER_SIZE};
use shale_common::page::{Page, PageId, PageType, PAYLOAD_SIZE};
use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};

const NUM_KEYS_OFFSET: usize = 0;
const ORDER_OFFSET: usize = 2;
const NEXT_LEAF_OFFSET: usize = 4;
const KEY_SIZE: usize = 4;
const SLOT_SIZE: usize = 8;

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
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

/// A leaf or internal node decoded in place from a page.
///
/// `P` is anything that derefs to a [`Page`]: a buffer pool lock guard in
/// the tree, a plain reference in tests. Read accessors need `Deref`,
/// mutators need `DerefMut`.
pub struct BTreeNode<P> {
    page: P,
    order: usize,
}

impl<P: Deref<Target = Page>> BTreeNode<P> {
    /// Wraps a page holding a node of the given order.
    pub fn new(page: P, order: usize) -> Self {
        let node = Self { page, order };
        assert!(
            node.values_offset_for(LEAF_NODE_HEADER_SIZE) + node.capacity() * SLOT_SIZE
                <= PAYLOAD_SIZE
                && node.values_offset_for(INTERNAL_NODE_HEADER_SIZE)
                    + (node.capacity() + 1) * SLOT_SIZE
                    <= PAYLOAD_SIZE,
            "order {order} does not fit in a page"
        );
        node
    }

    /// Returns the id of the underlying page.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page.page_id()
    }

    /// Returns true if the page is typed as a leaf.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.page.page_type() == PageType::Leaf
    }

    /// Returns true if the page is typed as an internal node.
    #[inline]
    pub fn is_internal(&self) -> bool {
        self.page.page_type() == PageType::Internal
    }

    /// Returns the order this view was built with.
    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Returns the order stamped on the page when it was formatted.
    #[inline]
    pub fn stored_order(&self) -> usize {
        read_u16(self.page.payload(), ORDER_OFFSET) as usize
    }

    /// Returns the number of key slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.order + 1
    }

    /// Returns the number of keys stored.
    #[inline]
    pub fn num_keys(&self) -> usize {
        read_u16(self.page.payload(), NUM_KEYS_OFFSET) as usize
    }

    /// Returns true if the node holds more keys than its order allows.
    #[inline]
    pub fn is_overflowing(&self) -> bool {
        self.num_keys() > self.order
    }

    /// Returns the key at `idx`.
    pub fn key_at(&self, idx: usize) -> i32 {
        let n = self.num_keys();
        assert!(idx < n, "key index {idx} out of range for {n} keys");
        read_u32(self.page.payload(), self.key_offset(idx)) as i32
    }

    /// Returns all keys in order.
    pub fn keys(&self) -> Vec<i32> {
        (0..self.num_keys()).map(|i| self.key_at(i)).collect()
    }

    /// Returns the value at `idx`. Leaf only.
    pub fn value_at(&self, idx: usize) -> u64 {
        self.assert_leaf("value_at");
        let n = self.num_keys();
        assert!(idx < n, "value index {idx} out of range for {n} keys");
        read_u64(self.page.payload(), self.slot_offset(idx))
    }

    /// Returns all values in key order. Leaf only.
    pub fn values(&self) -> Vec<u64> {
        (0..self.num_keys()).map(|i| self.value_at(i)).collect()
    }

    /// Returns the child at `idx`. Internal only.
    pub fn child_at(&self, idx: usize) -> PageId {
        self.assert_internal("child_at");
        let n = self.num_keys();
        assert!(idx <= n, "child index {idx} out of range for {n} keys");
        PageId::from_u64(read_u64(self.page.payload(), self.slot_offset(idx)))
    }

    /// Returns all `num_keys + 1` children. Internal only.
    pub fn children(&self) -> Vec<PageId> {
        (0..=self.num_keys()).map(|i| self.child_at(i)).collect()
    }

    /// Returns the next leaf in the chain, INVALID at the end. Leaf only.
    pub fn next_leaf(&self) -> PageId {
        self.assert_leaf("next_leaf");
        PageId(read_u32(self.page.payload(), NEXT_LEAF_OFFSET))
    }

    /// Returns the index holding `key`, if any.
    pub fn find_key_index(&self, key: i32) -> Option<usize> {
        (0..self.num_keys()).find(|&i| self.key_at(i) == key)
    }

    /// Returns the first index whose key is not less than `key`.
    pub fn lower_bound(&self, key: i32) -> usize {
        let n = self.num_keys();
        (0..n).find(|&i| self.key_at(i) >= key).unwrap_or(n)
    }

    /// Returns the index of the child whose subtree covers `key`: the number
    /// of separators less than or equal to it. Internal only.
    pub fn find_child_index(&self, key: i32) -> usize {
        self.assert_internal("find_child_index");
        let n = self.num_keys();
        (0..n).find(|&i| key < self.key_at(i)).unwrap_or(n)
    }

    /// One line summary used by tree dumps.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        if self.is_leaf() {
            let _ = write!(out, "Leaf {} keys={:?}", self.page_id(), self.keys());
            let next = self.next_leaf();
            if next.is_valid() {
                let _ = write!(out, " next={next}");
            }
        } else {
            let _ = write!(out, "Internal {} keys={:?}", self.page_id(), self.keys());
        }
        out
    }

    #[inline]
    fn keys_offset(&self) -> usize {
        if self.is_leaf() {
            LEAF_NODE_HEADER_SIZE
        } else {
            INTERNAL_NODE_HEADER_SIZE
        }
    }

    #[inline]
    fn key_offset(&self, idx: usize) -> usize {
        self.keys_offset() + idx * KEY_SIZE
    }

    #[inline]
    fn values_offset_for(&self, keys_offset: usize) -> usize {
        keys_offset + self.capacity() * KEY_SIZE
    }

    /// Offset of value or child slot `idx`.
    #[inline]
    fn slot_offset(&self, idx: usize) -> usize {
        self.values_offset_for(self.keys_offset()) + idx * SLOT_SIZE
    }

    fn assert_leaf(&self, op: &str) {
        assert!(
            self.is_leaf(),
            "{op} called on non-leaf page {} ({:?})",
            self.page_id(),
            self.page.page_type()
        );
    }

    fn assert_internal(&self, op: &str) {
        assert!(
            self.is_internal(),
            "{op} called on non-internal page {} ({:?})",
            self.page_id(),
            self.page.page_type()
        );
    }
}

impl<P: DerefMut<Target = Page>> BTreeNode<P> {
    /// Formats the page as an empty leaf with no next leaf.
    pub fn init_leaf(&mut self) {
        self.reset_payload(PageType::Leaf);
        self.set_next_leaf(PageId::INVALID);
    }

    /// Formats the page as an internal node with zero keys.
    ///
    /// The caller sets child 0 before adding separators.
    pub fn init_internal(&mut self) {
        self.reset_payload(PageType::Internal);
    }

    /// Sets the key count, truncating or exposing slots.
    pub fn set_num_keys(&mut self, n: usize) {
        let cap = self.capacity();
        assert!(n <= cap, "key count {n} exceeds capacity {cap}");
        self.write_bytes(NUM_KEYS_OFFSET, &(n as u16).to_le_bytes());
    }

    /// Overwrites the key at `idx`.
    pub fn set_key_at(&mut self, idx: usize, key: i32) {
        let n = self.num_keys();
        assert!(idx < n, "key index {idx} out of range for {n} keys");
        let offset = self.key_offset(idx);
        self.write_bytes(offset, &key.to_le_bytes());
    }

    /// Overwrites the value at `idx`. Leaf only.
    pub fn set_value_at(&mut self, idx: usize, value: u64) {
        self.assert_leaf("set_value_at");
        let n = self.num_keys();
        assert!(idx < n, "value index {idx} out of range for {n} keys");
        let offset = self.slot_offset(idx);
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Overwrites the child at `idx`. Internal only.
    pub fn set_child_at(&mut self, idx: usize, child: PageId) {
        self.assert_internal("set_child_at");
        let n = self.num_keys();
        assert!(idx <= n, "child index {idx} out of range for {n} keys");
        let offset = self.slot_offset(idx);
        self.write_bytes(offset, &child.as_u64().to_le_bytes());
    }

    /// Sets the next leaf link. Leaf only.
    pub fn set_next_leaf(&mut self, next: PageId) {
        self.assert_leaf("set_next_leaf");
        self.write_bytes(NEXT_LEAF_OFFSET, &next.0.to_le_bytes());
    }

    /// Inserts `key` at `idx`, shifting later keys right, and bumps the count.
    pub fn insert_key_at(&mut self, idx: usize, key: i32) {
        let n = self.num_keys();
        assert!(idx <= n, "key insert index {idx} out of range for {n} keys");
        assert!(n < self.capacity(), "node {} is full", self.page_id());
        self.shift_right(self.key_offset(idx), (n - idx) * KEY_SIZE, KEY_SIZE);
        self.set_num_keys(n + 1);
        self.set_key_at(idx, key);
    }

    /// Removes the key at `idx`, shifting later keys left, and drops the count.
    pub fn remove_key_at(&mut self, idx: usize) -> i32 {
        let key = self.key_at(idx);
        let n = self.num_keys();
        self.shift_left(self.key_offset(idx + 1), (n - idx - 1) * KEY_SIZE, KEY_SIZE);
        self.set_num_keys(n - 1);
        key
    }

    /// Inserts `value` at `idx` among the current `num_keys` values. Leaf only.
    ///
    /// The count is left alone; follow with [`insert_key_at`](Self::insert_key_at).
    pub fn insert_value_at(&mut self, idx: usize, value: u64) {
        self.assert_leaf("insert_value_at");
        let n = self.num_keys();
        assert!(idx <= n, "value insert index {idx} out of range for {n} keys");
        assert!(n < self.capacity(), "node {} is full", self.page_id());
        let offset = self.slot_offset(idx);
        self.shift_right(offset, (n - idx) * SLOT_SIZE, SLOT_SIZE);
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Removes the value at `idx`. Leaf only.
    ///
    /// The count is left alone; follow with [`remove_key_at`](Self::remove_key_at).
    pub fn remove_value_at(&mut self, idx: usize) -> u64 {
        let value = self.value_at(idx);
        let n = self.num_keys();
        self.shift_left(self.slot_offset(idx + 1), (n - idx - 1) * SLOT_SIZE, SLOT_SIZE);
        value
    }

    /// Inserts `child` at `idx` among the current `num_keys + 1` children.
    /// Internal only.
    ///
    /// The count is left alone; follow with [`insert_key_at`](Self::insert_key_at).
    pub fn insert_child_at(&mut self, idx: usize, child: PageId) {
        self.assert_internal("insert_child_at");
        let n = self.num_keys();
        assert!(idx <= n + 1, "child insert index {idx} out of range for {n} keys");
        assert!(n < self.capacity(), "node {} is full", self.page_id());
        let offset = self.slot_offset(idx);
        self.shift_right(offset, (n + 1 - idx) * SLOT_SIZE, SLOT_SIZE);
        self.write_bytes(offset, &child.as_u64().to_le_bytes());
    }

    /// Removes the child at `idx`. Internal only.
    ///
    /// The count is left alone; follow with [`remove_key_at`](Self::remove_key_at).
    pub fn remove_child_at(&mut self, idx: usize) -> PageId {
        let child = self.child_at(idx);
        let n = self.num_keys();
        self.shift_left(self.slot_offset(idx + 1), (n - idx) * SLOT_SIZE, SLOT_SIZE);
        child
    }

    /// Inserts a key/value pair at `idx`. Leaf only.
    pub fn insert_leaf_entry(&mut self, idx: usize, key: i32, value: u64) {
        self.insert_value_at(idx, value);
        self.insert_key_at(idx, key);
    }

    /// Removes and returns the key/value pair at `idx`. Leaf only.
    pub fn remove_leaf_entry(&mut self, idx: usize) -> (i32, u64) {
        let value = self.remove_value_at(idx);
        let key = self.remove_key_at(idx);
        (key, value)
    }

    /// Inserts separator `key` at `idx` with `right` as the child after it.
    /// Internal only.
    pub fn insert_separator(&mut self, idx: usize, key: i32, right: PageId) {
        self.insert_child_at(idx + 1, right);
        self.insert_key_at(idx, key);
    }

    /// Removes separator `idx` together with the child after it.
    /// Internal only.
    pub fn remove_separator(&mut self, idx: usize) -> (i32, PageId) {
        let right = self.remove_child_at(idx + 1);
        let key = self.remove_key_at(idx);
        (key, right)
    }

    /// Prepends `child` and `key` so the old child 0 follows `key`.
    /// Internal only.
    pub fn push_front(&mut self, child: PageId, key: i32) {
        self.insert_child_at(0, child);
        self.insert_key_at(0, key);
    }

    /// Removes child 0 and key 0. Internal only.
    pub fn pop_front(&mut self) -> (PageId, i32) {
        let child = self.remove_child_at(0);
        let key = self.remove_key_at(0);
        (child, key)
    }

    fn reset_payload(&mut self, page_type: PageType) {
        self.page.set_page_type(page_type);
        self.page.set_next_page_id(PageId(0));
        self.page.payload_mut().fill(0);
        let order = self.order as u16;
        self.write_bytes(ORDER_OFFSET, &order.to_le_bytes());
    }

    #[inline]
    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.page.payload_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Moves `len` bytes starting at `start` one slot of `width` to the right.
    #[inline]
    fn shift_right(&mut self, start: usize, len: usize, width: usize) {
        if len > 0 {
            self.page
                .payload_mut()
                .copy_within(start..start + len, start + width);
        }
    }

    /// Moves `len` bytes starting at `start` one slot of `width` to the left.
    #[inline]
    fn shift_left(&mut self, start: usize, len: usize, width: usize) {
        if len > 0 {
            self.page
                .payload_mut()
                .copy_within(start..start + len, start - width);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page(id: u32) -> Page {
        let mut page = Page::with_header(PageId(id), PageType::Invalid);
        BTreeNode::new(&mut page, 4).init_leaf();
        page
    }

    fn internal_page(id: u32, first_child: u32) -> Page {
        let mut page = Page::with_header(PageId(id), PageType::Invalid);
        let mut node = BTreeNode::new(&mut page, 4);
        node.init_internal();
        node.set_child_at(0, PageId(first_child));
        page
    }

    #[test]
    fn test_init_leaf() {
        let page = leaf_page(3);
        let node = BTreeNode::new(&page, 4);

        assert!(node.is_leaf());
        assert!(!node.is_internal());
        assert_eq!(node.num_keys(), 0);
        assert_eq!(node.capacity(), 5);
        assert_eq!(node.stored_order(), 4);
        assert_eq!(node.next_leaf(), PageId::INVALID);
        assert_eq!(node.page_id(), PageId(3));
    }

    #[test]
    fn test_stored_order_survives_other_views() {
        let mut page = internal_page(2, 7);
        BTreeNode::new(&mut page, 4).insert_separator(0, 50, PageId(8));

        let node = BTreeNode::new(&page, 64);
        assert_eq!(node.order(), 64);
        assert_eq!(node.stored_order(), 4);
        assert_eq!(BTreeNode::new(&page, 4).keys(), vec![50]);
    }

    #[test]
    fn test_leaf_insert_keeps_values_aligned() {
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, 4);

        node.insert_leaf_entry(0, 20, 200);
        node.insert_leaf_entry(0, 10, 100);
        node.insert_leaf_entry(2, 40, 400);
        node.insert_leaf_entry(2, 30, 300);

        assert_eq!(node.keys(), vec![10, 20, 30, 40]);
        assert_eq!(node.values(), vec![100, 200, 300, 400]);
        assert!(!node.is_overflowing());

        node.insert_leaf_entry(4, 50, 500);
        assert!(node.is_overflowing());
    }

    #[test]
    fn test_leaf_remove() {
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, 4);
        for (i, k) in [10, 20, 30].into_iter().enumerate() {
            node.insert_leaf_entry(i, k, k as u64 * 10);
        }

        assert_eq!(node.remove_leaf_entry(1), (20, 200));
        assert_eq!(node.keys(), vec![10, 30]);
        assert_eq!(node.values(), vec![100, 300]);

        assert_eq!(node.remove_leaf_entry(1), (30, 300));
        assert_eq!(node.remove_leaf_entry(0), (10, 100));
        assert_eq!(node.num_keys(), 0);
    }

    #[test]
    fn test_negative_keys() {
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, 4);
        node.insert_leaf_entry(0, -5, 1);
        node.insert_leaf_entry(0, i32::MIN, 2);

        assert_eq!(node.keys(), vec![i32::MIN, -5]);
        assert_eq!(node.find_key_index(-5), Some(1));
        assert_eq!(node.lower_bound(-6), 1);
    }

    #[test]
    fn test_find_key_index() {
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, 4);
        for (i, k) in [5, 6, 10].into_iter().enumerate() {
            node.insert_leaf_entry(i, k, 0);
        }

        assert_eq!(node.find_key_index(6), Some(1));
        assert_eq!(node.find_key_index(7), None);
        assert_eq!(node.lower_bound(7), 2);
        assert_eq!(node.lower_bound(11), 3);
    }

    #[test]
    fn test_next_leaf() {
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, 4);
        node.set_next_leaf(PageId(9));
        assert_eq!(node.next_leaf(), PageId(9));
        assert!(node.describe().contains("next=9"));
    }

    #[test]
    fn test_internal_separators() {
        let mut page = internal_page(7, 100);
        let mut node = BTreeNode::new(&mut page, 4);

        node.insert_separator(0, 20, PageId(102));
        node.insert_separator(0, 10, PageId(101));
        node.insert_separator(2, 30, PageId(103));

        assert_eq!(node.keys(), vec![10, 20, 30]);
        assert_eq!(
            node.children(),
            vec![PageId(100), PageId(101), PageId(102), PageId(103)]
        );

        assert_eq!(node.remove_separator(1), (20, PageId(102)));
        assert_eq!(node.keys(), vec![10, 30]);
        assert_eq!(node.children(), vec![PageId(100), PageId(101), PageId(103)]);
    }

    #[test]
    fn test_find_child_index() {
        let mut page = internal_page(7, 100);
        let mut node = BTreeNode::new(&mut page, 4);
        node.insert_separator(0, 10, PageId(101));
        node.insert_separator(1, 20, PageId(102));

        assert_eq!(node.find_child_index(5), 0);
        assert_eq!(node.find_child_index(10), 1);
        assert_eq!(node.find_child_index(15), 1);
        assert_eq!(node.find_child_index(20), 2);
        assert_eq!(node.find_child_index(99), 2);
    }

    #[test]
    fn test_push_pop_front() {
        let mut page = internal_page(7, 100);
        let mut node = BTreeNode::new(&mut page, 4);
        node.insert_separator(0, 10, PageId(101));

        node.push_front(PageId(99), 5);
        assert_eq!(node.keys(), vec![5, 10]);
        assert_eq!(node.children(), vec![PageId(99), PageId(100), PageId(101)]);

        assert_eq!(node.pop_front(), (PageId(99), 5));
        assert_eq!(node.keys(), vec![10]);
        assert_eq!(node.children(), vec![PageId(100), PageId(101)]);
    }

    #[test]
    fn test_truncate_with_set_num_keys() {
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, 4);
        for (i, k) in [1, 2, 3, 4].into_iter().enumerate() {
            node.insert_leaf_entry(i, k, k as u64);
        }
        node.set_num_keys(2);
        assert_eq!(node.keys(), vec![1, 2]);
        assert_eq!(node.values(), vec![1, 2]);
    }

    #[test]
    fn test_max_order_fills_page() {
        let order = shale_common::max_order();
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, order);
        for i in 0..=order {
            node.insert_leaf_entry(i, i as i32, i as u64);
        }
        assert_eq!(node.num_keys(), order + 1);
        assert_eq!(node.value_at(order), order as u64);

        let mut page = internal_page(2, 0);
        let mut node = BTreeNode::new(&mut page, order);
        for i in 0..=order {
            node.insert_separator(i, i as i32, PageId(i as u32 + 1));
        }
        assert_eq!(node.child_at(order + 1), PageId(order as u32 + 1));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_oversized_order_panics() {
        let page = leaf_page(1);
        let _ = BTreeNode::new(&page, shale_common::max_order() + 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_key_index_out_of_range_panics() {
        let page = leaf_page(1);
        BTreeNode::new(&page, 4).key_at(0);
    }

    #[test]
    #[should_panic(expected = "is full")]
    fn test_insert_into_full_node_panics() {
        let mut page = leaf_page(1);
        let mut node = BTreeNode::new(&mut page, 4);
        for i in 0..6 {
            node.insert_leaf_entry(i, i as i32, 0);
        }
    }

    #[test]
    #[should_panic(expected = "non-leaf")]
    fn test_next_leaf_on_internal_panics() {
        let page = internal_page(2, 1);
        BTreeNode::new(&page, 4).next_leaf();
    }

    #[test]
    #[should_panic(expected = "non-internal")]
    fn test_child_on_leaf_panics() {
        let page = leaf_page(1);
        BTreeNode::new(&page, 4).child_at(0);
    }
}
