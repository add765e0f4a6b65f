//! Single-file page storage with an on-disk freelist.

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use shale_buffer::FileManager;
use shale_common::page::{Page, PageId, PageType, PAGE_SIZE};
use shale_common::{Result, ShaleError, StorageConfig};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Page holding the file's allocation state.
pub const META_PAGE_ID: PageId = PageId(0);

/// Page reserved for the collection catalog.
pub const CATALOG_PAGE_ID: PageId = PageId(1);

/// First id handed out for data pages in a fresh file.
const FIRST_DATA_PAGE: u32 = 2;

/// Configuration for the disk file manager.
#[derive(Debug, Clone)]
pub struct DiskFileManagerConfig {
    /// Path of the database file.
    pub path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskFileManagerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./shale.db"),
            fsync_enabled: true,
        }
    }
}

impl From<&StorageConfig> for DiskFileManagerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            path: config.data_path.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Allocation state stored in the meta page payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Meta {
    /// Id the next file extension will receive.
    next_page_id: u32,
    /// Head of the freelist, INVALID when empty.
    free_list_head: PageId,
}

impl Meta {
    fn decode(page: &Page) -> Self {
        let mut buf = page.payload();
        Self {
            next_page_id: buf.get_u32_le(),
            free_list_head: PageId(buf.get_u32_le()),
        }
    }

    fn encode(&self) -> Page {
        let mut page = Page::with_header(META_PAGE_ID, PageType::Meta);
        let mut buf = page.payload_mut();
        buf.put_u32_le(self.next_page_id);
        buf.put_u32_le(self.free_list_head.0);
        page
    }
}

/// Reads and writes pages of one database file.
///
/// Page 0 is the meta page and page 1 belongs to the catalog. Freed pages are
/// chained through their header next link, newest first, and reused before
/// the file grows.
pub struct DiskFileManager {
    /// Configuration.
    config: DiskFileManagerConfig,
    /// Open file and cached meta state.
    inner: Mutex<DiskFile>,
}

/// Handle for the open data file.
struct DiskFile {
    /// The file handle.
    file: File,
    /// Number of pages in the file.
    num_pages: u32,
    /// In-memory copy of the meta page.
    meta: Meta,
}

impl DiskFile {
    fn read_at(&mut self, page_id: PageId, page: &mut Page) -> Result<()> {
        if page_id.0 >= self.num_pages {
            return Err(ShaleError::PageNotFound { page_id: page_id.0 });
        }
        let offset = page_id.as_u64() * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(page.data_mut())?;
        Ok(())
    }

    fn write_at(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        let offset = page_id.as_u64() * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(page.data())?;

        // Update page count if we extended the file
        if page_id.0 >= self.num_pages {
            self.num_pages = page_id.0 + 1;
        }
        Ok(())
    }

    fn store_meta(&mut self) -> Result<()> {
        let page = self.meta.encode();
        self.write_at(META_PAGE_ID, &page)
    }
}

impl DiskFileManager {
    /// Opens a database file, creating and initializing it if missing.
    pub fn open(config: DiskFileManagerConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;

        let file_size = file.metadata()?.len();
        let mut disk = DiskFile {
            file,
            num_pages: (file_size / PAGE_SIZE as u64) as u32,
            meta: Meta {
                next_page_id: FIRST_DATA_PAGE,
                free_list_head: PageId::INVALID,
            },
        };

        if disk.num_pages == 0 {
            disk.store_meta()?;
            disk.write_at(
                CATALOG_PAGE_ID,
                &Page::with_header(CATALOG_PAGE_ID, PageType::Meta),
            )?;
            disk.file.sync_all()?;
            info!(path = %config.path.display(), "created database file");
        } else {
            let mut page = Page::new();
            disk.read_at(META_PAGE_ID, &mut page)?;
            if page.page_type() != PageType::Meta || disk.num_pages < FIRST_DATA_PAGE {
                return Err(ShaleError::PageCorrupted {
                    page_id: META_PAGE_ID.0,
                    reason: "missing meta page".to_string(),
                });
            }
            disk.meta = Meta::decode(&page);
            if disk.meta.next_page_id != disk.num_pages {
                return Err(ShaleError::PageCorrupted {
                    page_id: META_PAGE_ID.0,
                    reason: format!(
                        "meta records {} pages, file holds {}",
                        disk.meta.next_page_id, disk.num_pages
                    ),
                });
            }
            info!(
                path = %config.path.display(),
                pages = disk.num_pages,
                "opened database file"
            );
        }

        Ok(Self {
            config,
            inner: Mutex::new(disk),
        })
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Returns the number of pages in the file, meta and catalog included.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Walks the freelist from its head.
    pub fn free_list(&self) -> Result<Vec<PageId>> {
        let mut inner = self.inner.lock();
        let mut ids = Vec::new();
        let mut page = Page::new();
        let mut current = inner.meta.free_list_head;

        while current.is_valid() {
            if ids.len() as u32 >= inner.num_pages {
                return Err(ShaleError::PageCorrupted {
                    page_id: current.0,
                    reason: "freelist cycle".to_string(),
                });
            }
            ids.push(current);
            inner.read_at(current, &mut page)?;
            current = page.next_page_id();
        }
        Ok(ids)
    }

    fn sync_if_enabled(&self, disk: &DiskFile) -> Result<()> {
        if self.config.fsync_enabled {
            disk.file.sync_all()?;
        }
        Ok(())
    }
}

impl FileManager for DiskFileManager {
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<()> {
        self.inner.lock().read_at(page_id, page)
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let mut inner = self.inner.lock();
        let page_id = page.page_id();
        if page_id.0 >= inner.num_pages {
            return Err(ShaleError::PageNotFound { page_id: page_id.0 });
        }
        inner.write_at(page_id, page)?;
        self.sync_if_enabled(&inner)
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        let page_id = if inner.meta.free_list_head.is_valid() {
            let head = inner.meta.free_list_head;
            let mut page = Page::new();
            inner.read_at(head, &mut page)?;
            if page.page_type() != PageType::Free {
                return Err(ShaleError::PageCorrupted {
                    page_id: head.0,
                    reason: format!("freelist entry has type {:?}", page.page_type()),
                });
            }
            inner.meta.free_list_head = page.next_page_id();
            head
        } else {
            let id = PageId(inner.meta.next_page_id);
            inner.meta.next_page_id += 1;
            id
        };

        inner.write_at(page_id, &Page::with_header(page_id, PageType::Invalid))?;
        inner.store_meta()?;
        self.sync_if_enabled(&inner)?;

        debug!(page_id = %page_id, "allocated page");
        Ok(page_id)
    }

    fn free_page(&self, page_id: PageId) -> Result<()> {
        if page_id == META_PAGE_ID || page_id == CATALOG_PAGE_ID {
            return Err(ShaleError::ReservedPage { page_id: page_id.0 });
        }

        let mut inner = self.inner.lock();
        let mut page = Page::new();
        inner.read_at(page_id, &mut page)?;
        if page.page_type() == PageType::Free {
            return Err(ShaleError::PageCorrupted {
                page_id: page_id.0,
                reason: "page freed twice".to_string(),
            });
        }

        let mut freed = Page::with_header(page_id, PageType::Free);
        freed.set_next_page_id(inner.meta.free_list_head);
        inner.write_at(page_id, &freed)?;
        inner.meta.free_list_head = page_id;
        inner.store_meta()?;
        self.sync_if_enabled(&inner)
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn page_exists(&self, page_id: PageId) -> bool {
        page_id.0 < self.inner.lock().num_pages
    }
}

impl Drop for DiskFileManager {
    fn drop(&mut self) {
        if let Err(e) = self.inner.get_mut().file.sync_all() {
            warn!(path = %self.config.path.display(), error = %e, "failed to sync database file");
        }
    }
}
