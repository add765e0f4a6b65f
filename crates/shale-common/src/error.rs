//! Error types for ShaleDB.

use thiserror::Error;

/// Result type alias using ShaleError.
pub type Result<T> = std::result::Result<T, ShaleError>;

/// Errors that can occur in ShaleDB operations.
///
/// Missing keys and duplicate inserts are ordinary outcomes of the index
/// API and are reported through `Option`/`bool`, not through this type.
#[derive(Debug, Error)]
pub enum ShaleError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u32 },

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: u32, reason: String },

    #[error("Buffer pool full, no unpinned frame to evict")]
    BufferPoolFull,

    #[error("Page {page_id} is pinned")]
    PagePinned { page_id: u32 },

    #[error("Page {page_id} is reserved and cannot be freed")]
    ReservedPage { page_id: u32 },

    // B+ tree errors
    #[error("Invalid B+ tree order {order} (supported range {min}..={max})")]
    InvalidOrder { order: usize, min: usize, max: usize },

    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    // Catalog errors
    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Catalog page full")]
    CatalogFull,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),
}
