//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use std::collections::BTreeMap;

/// Trait for page replacement algorithms.
///
/// Replacers are owned by the pool state and only touched under the pool
/// lock, so they take `&mut self` and carry no locking of their own.
pub trait Replacer: Send {
    /// Records that the given frame was accessed.
    fn record_access(&mut self, frame_id: FrameId);

    /// Marks a frame as evictable (unpinned) or not.
    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame for eviction and stops tracking it.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&mut self) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&mut self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Least-recently-used replacement.
///
/// Every resident frame carries the tick of its last access. Eviction walks
/// frames from the oldest tick and picks the first one marked evictable, so
/// a pinned frame keeps its recency and is simply skipped.
pub struct LruReplacer {
    /// Total number of frames.
    num_frames: usize,
    /// Monotonic access counter.
    tick: u64,
    /// Last access tick per frame, None when untracked.
    last_access: Vec<Option<u64>>,
    /// Tracked frames ordered by last access.
    recency: BTreeMap<u64, FrameId>,
    /// Evictable flag per frame.
    evictable: Vec<bool>,
    /// Number of tracked frames marked evictable.
    evictable_count: usize,
}

impl LruReplacer {
    /// Creates a new LRU replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames,
            tick: 0,
            last_access: vec![None; num_frames],
            recency: BTreeMap::new(),
            evictable: vec![false; num_frames],
            evictable_count: 0,
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.num_frames
    }

    /// Returns tracked frames from least to most recently used.
    pub fn lru_order(&self) -> Vec<FrameId> {
        self.recency.values().copied().collect()
    }

    #[inline]
    fn in_range(&self, frame_id: FrameId) -> bool {
        (frame_id.0 as usize) < self.num_frames
    }

    fn untrack(&mut self, frame_id: FrameId) {
        let idx = frame_id.0 as usize;
        if let Some(tick) = self.last_access[idx].take() {
            self.recency.remove(&tick);
        }
        if self.evictable[idx] {
            self.evictable[idx] = false;
            self.evictable_count -= 1;
        }
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        if !self.in_range(frame_id) {
            return;
        }
        let idx = frame_id.0 as usize;
        if let Some(old) = self.last_access[idx] {
            self.recency.remove(&old);
        }
        self.tick += 1;
        self.last_access[idx] = Some(self.tick);
        self.recency.insert(self.tick, frame_id);
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if !self.in_range(frame_id) {
            return;
        }
        let idx = frame_id.0 as usize;
        if self.last_access[idx].is_none() || self.evictable[idx] == evictable {
            return;
        }
        self.evictable[idx] = evictable;
        if evictable {
            self.evictable_count += 1;
        } else {
            self.evictable_count -= 1;
        }
    }

    fn evict(&mut self) -> Option<FrameId> {
        if self.evictable_count == 0 {
            return None;
        }
        let victim = self
            .recency
            .values()
            .copied()
            .find(|fid| self.evictable[fid.0 as usize])?;
        self.untrack(victim);
        Some(victim)
    }

    fn remove(&mut self, frame_id: FrameId) {
        if self.in_range(frame_id) {
            self.untrack(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.evictable_count
    }
}
