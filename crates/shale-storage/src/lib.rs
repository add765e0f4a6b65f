//! Storage engine for ShaleDB.
//!
//! This crate provides:
//! - Disk file manager with a meta page and an on-disk freelist
//! - B+ tree index over the buffer pool
//! - Catalog mapping collection names to their root pages

mod btree;
mod catalog;
mod disk;

pub use btree::{BPlusTree, BTreeNode};
pub use catalog::{Catalog, CollectionInfo};
pub use disk::{DiskFileManager, DiskFileManagerConfig, CATALOG_PAGE_ID, META_PAGE_ID};
