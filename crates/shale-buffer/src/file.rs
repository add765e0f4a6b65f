//! Physical page I/O consumed by the buffer pool.

use parking_lot::Mutex;
use shale_common::page::{Page, PageId, PageType};
use shale_common::{Result, ShaleError};

/// Raw page storage behind the buffer pool.
///
/// The buffer pool is the only caller. Implementations own page identity:
/// they hand out ids, recycle freed ones, and move whole pages to and from
/// their backing store.
pub trait FileManager: Send + Sync {
    /// Reads a page into `page`, overwriting its contents.
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<()>;

    /// Writes a page at the id stored in its header.
    fn write_page(&self, page: &Page) -> Result<()>;

    /// Allocates a page, reusing a freed id when one is available.
    fn allocate_page(&self) -> Result<PageId>;

    /// Returns a page id to the freelist.
    fn free_page(&self, page_id: PageId) -> Result<()>;

    /// Forces buffered writes to stable storage.
    fn flush(&self) -> Result<()>;

    /// Returns true if the page has been allocated at some point.
    fn page_exists(&self, page_id: PageId) -> bool;
}

/// Volatile page storage for tests and throwaway indexes.
///
/// Freed ids are threaded through the page headers exactly like the
/// on-disk freelist and reused LIFO.
pub struct MemoryFileManager {
    inner: Mutex<MemoryPages>,
}

struct MemoryPages {
    /// Pages stored by id (index = page id).
    pages: Vec<Page>,
    /// Head of the freelist, INVALID when empty.
    free_head: PageId,
    /// Number of `write_page` calls served.
    writes: u64,
}

impl MemoryFileManager {
    /// Creates an empty page store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryPages {
                pages: Vec::new(),
                free_head: PageId::INVALID,
                writes: 0,
            }),
        }
    }

    /// Returns the number of pages ever allocated.
    pub fn num_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Returns the number of writes received so far.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }

    /// Returns the ids on the freelist, head first.
    pub fn free_list(&self) -> Vec<PageId> {
        let inner = self.inner.lock();
        let mut ids = Vec::new();
        let mut current = inner.free_head;
        while current.is_valid() {
            ids.push(current);
            current = inner.pages[current.0 as usize].next_page_id();
        }
        ids
    }
}

impl Default for MemoryFileManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileManager for MemoryFileManager {
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<()> {
        let inner = self.inner.lock();
        let stored = inner
            .pages
            .get(page_id.0 as usize)
            .ok_or(ShaleError::PageNotFound { page_id: page_id.0 })?;
        page.data_mut().copy_from_slice(stored.data());
        Ok(())
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let mut inner = self.inner.lock();
        let page_id = page.page_id();
        let stored = inner
            .pages
            .get_mut(page_id.0 as usize)
            .ok_or(ShaleError::PageNotFound { page_id: page_id.0 })?;
        stored.data_mut().copy_from_slice(page.data());
        inner.writes += 1;
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        if inner.free_head.is_valid() {
            let page_id = inner.free_head;
            let slot = &mut inner.pages[page_id.0 as usize];
            let next = slot.next_page_id();
            *slot = Page::with_header(page_id, PageType::Invalid);
            inner.free_head = next;
            return Ok(page_id);
        }

        let page_id = PageId(inner.pages.len() as u32);
        inner
            .pages
            .push(Page::with_header(page_id, PageType::Invalid));
        Ok(page_id)
    }

    fn free_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let head = inner.free_head;
        let slot = inner
            .pages
            .get_mut(page_id.0 as usize)
            .ok_or(ShaleError::PageNotFound { page_id: page_id.0 })?;
        *slot = Page::with_header(page_id, PageType::Free);
        slot.set_next_page_id(head);
        inner.free_head = page_id;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn page_exists(&self, page_id: PageId) -> bool {
        (page_id.0 as usize) < self.inner.lock().pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_sequential_ids() {
        let fm = MemoryFileManager::new();
        assert_eq!(fm.allocate_page().unwrap(), PageId(0));
        assert_eq!(fm.allocate_page().unwrap(), PageId(1));
        assert_eq!(fm.allocate_page().unwrap(), PageId(2));
        assert_eq!(fm.num_pages(), 3);
    }

    #[test]
    fn test_allocated_page_is_blank_with_id() {
        let fm = MemoryFileManager::new();
        let id = fm.allocate_page().unwrap();

        let mut page = Page::new();
        page.payload_mut()[0] = 0xFF;
        fm.read_page(id, &mut page).unwrap();

        assert_eq!(page.page_id(), id);
        assert_eq!(page.page_type(), PageType::Invalid);
        assert_eq!(page.payload()[0], 0);
    }

    #[test]
    fn test_write_read() {
        let fm = MemoryFileManager::new();
        let id = fm.allocate_page().unwrap();

        let mut page = Page::with_header(id, PageType::Leaf);
        page.payload_mut()[10] = 0xAB;
        fm.write_page(&page).unwrap();
        assert_eq!(fm.write_count(), 1);

        let mut read = Page::new();
        fm.read_page(id, &mut read).unwrap();
        assert_eq!(read.page_type(), PageType::Leaf);
        assert_eq!(read.payload()[10], 0xAB);
    }

    #[test]
    fn test_read_unknown_page() {
        let fm = MemoryFileManager::new();
        let mut page = Page::new();
        let result = fm.read_page(PageId(5), &mut page);
        assert!(matches!(result, Err(ShaleError::PageNotFound { page_id: 5 })));
        assert!(!fm.page_exists(PageId(5)));
    }

    #[test]
    fn test_free_list_reuse_is_lifo() {
        let fm = MemoryFileManager::new();
        for _ in 0..4 {
            fm.allocate_page().unwrap();
        }

        fm.free_page(PageId(1)).unwrap();
        fm.free_page(PageId(3)).unwrap();
        assert_eq!(fm.free_list(), vec![PageId(3), PageId(1)]);

        let mut page = Page::new();
        fm.read_page(PageId(3), &mut page).unwrap();
        assert_eq!(page.page_type(), PageType::Free);
        assert_eq!(page.next_page_id(), PageId(1));

        assert_eq!(fm.allocate_page().unwrap(), PageId(3));
        assert_eq!(fm.allocate_page().unwrap(), PageId(1));
        assert_eq!(fm.allocate_page().unwrap(), PageId(4));
        assert!(fm.free_list().is_empty());
    }
}
