//! Collection catalog stored in a single page.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use shale_buffer::BufferPool;
use shale_common::page::{Page, PageId, PageType};
use shale_common::{Result, ShaleError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a collection's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Root of the collection's B+ tree, INVALID while the tree is empty.
    pub root_page_id: PageId,
    /// First page of the collection's record heap.
    pub heap_start_page_id: PageId,
}

impl CollectionInfo {
    /// Creates an entry pointing at the given tree root and heap start.
    pub fn new(root_page_id: PageId, heap_start_page_id: PageId) -> Self {
        Self {
            root_page_id,
            heap_start_page_id,
        }
    }
}

type Entries = BTreeMap<String, CollectionInfo>;

/// Persistent map from collection name to [`CollectionInfo`].
///
/// Entries are encoded in the payload of one page:
///
/// ```text
/// count: u16
/// repeated count times:
///   name_len: u16 | name: [u8; name_len] | root: u32 | heap: u32
/// ```
///
/// Every call decodes the page, applies its change and writes the page back
/// under the page's write lock.
pub struct Catalog {
    pool: Arc<BufferPool>,
    page_id: PageId,
}

impl Catalog {
    /// Opens the catalog stored in `page_id`, formatting the page if it has
    /// never been used.
    pub fn open(pool: Arc<BufferPool>, page_id: PageId) -> Result<Self> {
        {
            let guard = pool.fetch_page(page_id)?;
            let page_type = guard.read().page_type();
            match page_type {
                PageType::Meta => {
                    decode(&guard.read(), page_id)?;
                }
                PageType::Invalid => {
                    let mut page = guard.write();
                    page.set_page_type(PageType::Meta);
                    encode(&Entries::new(), &mut page)?;
                    debug!(page_id = %page_id, "formatted catalog page");
                }
                other => {
                    return Err(ShaleError::PageCorrupted {
                        page_id: page_id.0,
                        reason: format!("catalog page has type {other:?}"),
                    });
                }
            }
        }
        Ok(Self { pool, page_id })
    }

    /// Returns the page holding the catalog.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Registers a new collection.
    pub fn create_collection(&self, name: &str, info: CollectionInfo) -> Result<()> {
        self.modify(|entries| {
            if entries.contains_key(name) {
                return Err(ShaleError::CollectionExists(name.to_string()));
            }
            entries.insert(name.to_string(), info);
            Ok(())
        })?;
        info!(
            collection = name,
            root = %info.root_page_id,
            heap = %info.heap_start_page_id,
            "created collection"
        );
        Ok(())
    }

    /// Looks up a collection.
    pub fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let guard = self.pool.fetch_page(self.page_id)?;
        let entries = decode(&guard.read(), self.page_id)?;
        Ok(entries.get(name).copied())
    }

    /// Replaces the stored location of an existing collection, typically
    /// after its tree root moved.
    pub fn update_collection(&self, name: &str, info: CollectionInfo) -> Result<()> {
        self.modify(|entries| match entries.get_mut(name) {
            Some(slot) => {
                *slot = info;
                Ok(())
            }
            None => Err(ShaleError::CollectionNotFound(name.to_string())),
        })?;
        debug!(collection = name, root = %info.root_page_id, "updated collection");
        Ok(())
    }

    /// Removes a collection and returns its last stored location.
    pub fn drop_collection(&self, name: &str) -> Result<CollectionInfo> {
        let info = self.modify(|entries| {
            entries
                .remove(name)
                .ok_or_else(|| ShaleError::CollectionNotFound(name.to_string()))
        })?;
        info!(collection = name, "dropped collection");
        Ok(info)
    }

    /// Returns all collections sorted by name.
    pub fn collections(&self) -> Result<Vec<(String, CollectionInfo)>> {
        let guard = self.pool.fetch_page(self.page_id)?;
        let entries = decode(&guard.read(), self.page_id)?;
        Ok(entries.into_iter().collect())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut Entries) -> Result<T>) -> Result<T> {
        let guard = self.pool.fetch_page(self.page_id)?;
        let mut page = guard.write();
        let mut entries = decode(&page, self.page_id)?;
        let out = f(&mut entries)?;
        encode(&entries, &mut page)?;
        Ok(out)
    }
}

fn decode(page: &Page, page_id: PageId) -> Result<Entries> {
    let corrupted = |reason: &str| ShaleError::PageCorrupted {
        page_id: page_id.0,
        reason: format!("catalog {reason}"),
    };

    let mut buf = page.payload();
    let count = buf.get_u16_le();
    let mut entries = Entries::new();
    for _ in 0..count {
        if buf.remaining() < 2 {
            return Err(corrupted("entry truncated"));
        }
        let name_len = buf.get_u16_le() as usize;
        if buf.remaining() < name_len + 8 {
            return Err(corrupted("entry truncated"));
        }
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| corrupted("name is not UTF-8"))?
            .to_string();
        buf.advance(name_len);
        let info = CollectionInfo::new(PageId(buf.get_u32_le()), PageId(buf.get_u32_le()));
        entries.insert(name, info);
    }
    Ok(entries)
}

fn encode(entries: &Entries, page: &mut Page) -> Result<()> {
    let size = 2 + entries.keys().map(|name| 2 + name.len() + 8).sum::<usize>();
    if size > page.payload().len() {
        return Err(ShaleError::CatalogFull);
    }

    let mut buf = page.payload_mut();
    buf.put_u16_le(entries.len() as u16);
    for (name, info) in entries {
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name.as_bytes());
        buf.put_u32_le(info.root_page_id.0);
        buf.put_u32_le(info.heap_start_page_id.0);
    }
    Ok(())
}
