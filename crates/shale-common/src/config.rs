//! Configuration structures for ShaleDB.

use crate::error::{Result, ShaleError};
use crate::page::{PAGE_SIZE, PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest supported B+ tree order.
pub const MIN_ORDER: usize = 3;

/// Default B+ tree order.
pub const DEFAULT_ORDER: usize = 4;

/// Leaf node header: num_keys (2) + reserved (2) + next_leaf (4).
pub const LEAF_NODE_HEADER_SIZE: usize = 8;

/// Internal node header: num_keys (2) + reserved (2).
pub const INTERNAL_NODE_HEADER_SIZE: usize = 4;

/// Largest order whose leaf and internal layouts both fit in one page.
///
/// A node holds up to `order + 1` keys between an insert and its split, so
/// the encoded capacity is one slot larger than the order.
pub const fn max_order() -> usize {
    // leaf: header + cap * (4 + 8)
    let leaf_cap = (PAYLOAD_SIZE - LEAF_NODE_HEADER_SIZE) / 12;
    // internal: header + cap * 4 + (cap + 1) * 8
    let internal_cap = (PAYLOAD_SIZE - INTERNAL_NODE_HEADER_SIZE - 8) / 12;
    let cap = if leaf_cap < internal_cap {
        leaf_cap
    } else {
        internal_cap
    };
    cap - 1
}

/// Validates a B+ tree order against the page layout.
pub fn validate_order(order: usize) -> Result<()> {
    if (MIN_ORDER..=max_order()).contains(&order) {
        Ok(())
    } else {
        Err(ShaleError::InvalidOrder {
            order,
            min: MIN_ORDER,
            max: max_order(),
        })
    }
}

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the single database file.
    pub data_path: PathBuf,
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// Maximum keys per B+ tree node before it splits.
    pub btree_order: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./shale.db"),
            buffer_pool_pages: 256, // 1 MB with 4 KB pages
            btree_order: DEFAULT_ORDER,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_pages * PAGE_SIZE
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        // Splits and merges pin up to three pages at once.
        if self.buffer_pool_pages < 3 {
            return Err(ShaleError::ConfigError(format!(
                "buffer_pool_pages must be at least 3, got {}",
                self.buffer_pool_pages
            )));
        }
        if self.data_path.as_os_str().is_empty() {
            return Err(ShaleError::ConfigError("data_path is empty".to_string()));
        }
        validate_order(self.btree_order)
    }
}
