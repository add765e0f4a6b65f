//! Buffer pool management for ShaleDB.
//!
//! This crate provides:
//! - The `FileManager` seam for physical page I/O, with an in-memory store
//! - Buffer frames holding one page each
//! - LRU page replacement over unpinned frames
//! - The buffer pool with RAII pin guards

mod file;
mod frame;
mod pool;
mod replacer;

pub use file::{FileManager, MemoryFileManager};
pub use frame::{BufferFrame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, PageGuard};
pub use replacer::{LruReplacer, Replacer};
