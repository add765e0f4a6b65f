//! Buffer pool manager.

use crate::file::FileManager;
use crate::frame::{BufferFrame, FrameId};
use crate::replacer::{LruReplacer, Replacer};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use shale_common::page::{Page, PageId};
use shale_common::{Result, ShaleError, StorageConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 256 }
    }
}

impl From<&StorageConfig> for BufferPoolConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            num_frames: config.buffer_pool_pages,
        }
    }
}

/// Bookkeeping guarded by the single pool-wide lock.
struct PoolState {
    /// Resident pages.
    page_table: HashMap<PageId, FrameId>,
    /// Frames holding no page.
    free_list: Vec<FrameId>,
    /// Recency order over resident frames.
    replacer: LruReplacer,
}

/// Buffer pool manager.
///
/// Caches a fixed number of page frames in front of a [`FileManager`]:
/// - Page ID to frame ID mapping for resident pages
/// - Pin counting; a pinned frame is never evicted
/// - LRU eviction over unpinned frames, writing dirty victims back first
/// - Dirty tracking and explicit flushes
///
/// Every public call runs as one critical section on the pool lock. Page
/// bytes are reached through [`PageGuard`], which holds a pin for as long as
/// it lives and releases it on drop.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Physical page I/O.
    file_manager: Arc<dyn FileManager>,
    /// Page table, free frames and replacement state.
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates a new buffer pool over the given file manager.
    pub fn new(config: BufferPoolConfig, file_manager: Arc<dyn FileManager>) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // Pop order hands out frame 0 first.
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            file_manager,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(num_frames),
                free_list,
                replacer: LruReplacer::new(num_frames),
            }),
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Checks if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    /// Returns the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        let frame_id = state.page_table.get(&page_id)?;
        Some(self.frames[frame_id.0 as usize].pin_count())
    }

    /// Returns the dirty flag of a resident page.
    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        let state = self.state.lock();
        let frame_id = state.page_table.get(&page_id)?;
        Some(self.frames[frame_id.0 as usize].is_dirty())
    }

    /// Returns the file manager behind this pool.
    pub fn file_manager(&self) -> &Arc<dyn FileManager> {
        &self.file_manager
    }

    /// Fetches a page, loading it from the file manager on a miss.
    ///
    /// The page is pinned until the returned guard is dropped. Fails with
    /// `BufferPoolFull` when the page is not resident and every frame is
    /// pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            trace!(page_id = %page_id, frame = %frame_id, "buffer pool hit");
            return Ok(PageGuard::new(self, page_id, frame));
        }

        let frame_id = self.allocate_frame(&mut state)?;
        let frame = &self.frames[frame_id.0 as usize];

        let loaded = self.file_manager.read_page(page_id, &mut frame.write());
        if let Err(e) = loaded {
            frame.reset();
            state.free_list.push(frame_id);
            return Err(e);
        }

        frame.set_page_id(Some(page_id));
        frame.set_dirty(false);
        frame.pin();
        state.page_table.insert(page_id, frame_id);
        state.replacer.record_access(frame_id);
        trace!(page_id = %page_id, frame = %frame_id, "buffer pool miss");

        Ok(PageGuard::new(self, page_id, frame))
    }

    /// Allocates a page through the file manager.
    ///
    /// No frame is reserved; the page is loaded on its first fetch.
    pub fn allocate_page(&self) -> Result<PageId> {
        self.file_manager.allocate_page()
    }

    /// Allocates a page and fetches it pinned.
    pub fn new_page(&self) -> Result<PageGuard<'_>> {
        let page_id = self.allocate_page()?;
        self.fetch_page(page_id)
    }

    /// Marks a resident page as modified. No-op if the page is not resident.
    pub fn mark_dirty(&self, page_id: PageId) {
        let state = self.state.lock();
        if let Some(frame_id) = state.page_table.get(&page_id) {
            self.frames[frame_id.0 as usize].set_dirty(true);
        }
    }

    /// Writes a resident dirty page back and clears its dirty flag.
    ///
    /// Returns true if the page was written.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let Some(guard) = self.pin_resident(page_id) else {
            return Ok(false);
        };
        if !guard.frame.is_dirty() {
            return Ok(false);
        }

        let page = guard.read();
        self.file_manager.write_page(&page)?;
        guard.frame.set_dirty(false);
        trace!(page_id = %page_id, "flushed page");
        Ok(true)
    }

    /// Flushes all dirty pages and syncs the file manager.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all(&self) -> Result<usize> {
        // Collect first so no frame lock is taken under the pool lock.
        let resident: Vec<PageId> = {
            let state = self.state.lock();
            state
                .page_table
                .iter()
                .filter(|(_, fid)| self.frames[fid.0 as usize].is_dirty())
                .map(|(&pid, _)| pid)
                .collect()
        };

        let mut flushed = 0;
        for page_id in resident {
            if self.flush_page(page_id)? {
                flushed += 1;
            }
        }
        self.file_manager.flush()?;

        debug!(flushed, "flushed buffer pool");
        Ok(flushed)
    }

    /// Drops a page from the cache and returns its id to the freelist.
    ///
    /// Fails with `PagePinned` if someone still holds the page.
    pub fn free_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                return Err(ShaleError::PagePinned { page_id: page_id.0 });
            }
            if frame.is_dirty() {
                warn!(page_id = %page_id, "discarding dirty page on free");
            }
            state.page_table.remove(&page_id);
            state.replacer.remove(frame_id);
            frame.reset();
            state.free_list.push(frame_id);
        }

        self.file_manager.free_page(page_id)?;
        debug!(page_id = %page_id, "freed page");
        Ok(())
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;

        for frame_id in state.page_table.values() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: state.free_list.len(),
            used_frames: state.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }

    /// Takes a frame from the free list or evicts the least recently used
    /// unpinned page, writing it back first if dirty.
    fn allocate_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }

        let victim_id = state.replacer.evict().ok_or(ShaleError::BufferPoolFull)?;
        let frame = &self.frames[victim_id.0 as usize];
        debug_assert!(!frame.is_pinned(), "evicted a pinned frame");

        if let Some(old_page_id) = frame.page_id() {
            if frame.is_dirty() {
                let written = self.file_manager.write_page(&frame.read());
                if let Err(e) = written {
                    // Keep the victim resident so its changes are not lost.
                    state.replacer.record_access(victim_id);
                    state.replacer.set_evictable(victim_id, true);
                    return Err(e);
                }
            }
            state.page_table.remove(&old_page_id);
            trace!(page_id = %old_page_id, frame = %victim_id, dirty = frame.is_dirty(), "evicted page");
        }

        frame.reset();
        Ok(victim_id)
    }

    /// Pins a page only if it is already resident.
    fn pin_resident(&self, page_id: PageId) -> Option<PageGuard<'_>> {
        let mut state = self.state.lock();
        let frame_id = *state.page_table.get(&page_id)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.pin();
        state.replacer.set_evictable(frame_id, false);
        Some(PageGuard::new(self, page_id, frame))
    }

    /// Releases one pin on a frame.
    fn unpin_frame(&self, page_id: PageId, frame: &BufferFrame) {
        let mut state = self.state.lock();
        if !frame.is_pinned() {
            warn!(page_id = %page_id, "unpin of a page that is not pinned");
            return;
        }
        if frame.unpin() == 0 {
            state.replacer.set_evictable(frame.frame_id(), true);
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!(error = %e, "failed to flush buffer pool on drop");
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// A pinned page. Dropping the guard releases the pin.
///
/// The page cannot be evicted while a guard exists, so lock guards obtained
/// from [`read`](Self::read) and [`write`](Self::write) are always for the
/// page named by [`page_id`](Self::page_id).
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame: &'a BufferFrame,
}

impl<'a> PageGuard<'a> {
    fn new(pool: &'a BufferPool, page_id: PageId, frame: &'a BufferFrame) -> Self {
        Self {
            pool,
            page_id,
            frame,
        }
    }

    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Locks the page for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.read()
    }

    /// Locks the page for writing and marks it dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let page = self.frame.write();
        // Set while holding the lock so a concurrent flush cannot clear it
        // before these changes are written.
        self.frame.set_dirty(true);
        page
    }

    /// Marks the page as dirty.
    pub fn mark_dirty(&self) {
        self.frame.set_dirty(true);
    }

    /// Returns the current pin count of the page.
    pub fn pin_count(&self) -> u32 {
        self.frame.pin_count()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_frame(self.page_id, self.frame);
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("frame", &self.frame.frame_id())
            .finish()
    }
}
