//! Page-based B+ tree index.
//!
//! Keys are `i32`, values are opaque `u64` record locators. Nodes are pages
//! owned by the buffer pool; [`BTreeNode`] decodes one in place and
//! [`BPlusTree`] runs search, insert with splits, and remove with borrows
//! and merges on top of it.
//!
//! ```text
//!                 [Internal 30 | 50]
//!               /        |         \
//!     [Leaf 10 20] -> [Leaf 30 40] -> [Leaf 50 60 70] -> INVALID
//! ```

mod node;
mod tree;

pub use node::BTreeNode;
pub use tree::BPlusTree;
