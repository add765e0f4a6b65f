//! ShaleDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all ShaleDB components.

pub mod config;
pub mod error;
pub mod page;

pub use config::{max_order, validate_order, StorageConfig, DEFAULT_ORDER, MIN_ORDER};
pub use error::{Result, ShaleError};
pub use page::{Page, PageHeader, PageId, PageType, PAGE_SIZE, PAYLOAD_SIZE};
