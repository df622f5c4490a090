use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, trace};

use crate::page::Page;
use crate::replacer::{ClockReplacer, FrameId, Replacer};
use crate::{DiskManager, INVALID_PAGE_ID, PageId};

/// Errors returned by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// The buffer pool lock was poisoned.
    #[error("buffer pool lock poisoned")]
    LockPoisoned,
    /// The underlying disk manager failed.
    #[error("disk manager error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for buffer pool results.
pub type BufferPoolResult<T> = Result<T, BufferPoolError>;

/// Guard that provides access to a pinned page while holding the pool lock.
pub struct PageGuard<'a> {
    state: MutexGuard<'a, BufferPoolState>,
    frame_id: FrameId,
}

impl<'a> PageGuard<'a> {
    /// Returns the frame id backing this guard.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.state.pages[self.frame_id]
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.pages[self.frame_id]
    }
}

struct BufferPoolState {
    disk_manager: DiskManager,
    replacer: ClockReplacer,
    pages: Vec<Page>,
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
}

#[derive(Default)]
struct BufferPoolMetrics {
    fetch_count: AtomicUsize,
}

/// Buffer pool manager for caching pages between disk and memory.
///
/// Invariants held at every return point: a frame is either on the free
/// list or mapped in the page table, never both; a mapped frame's page
/// metadata carries the same id as its page-table key; a frame with a
/// nonzero pin count is never offered to the replacer.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<Mutex<BufferPoolState>>,
    metrics: Arc<BufferPoolMetrics>,
}

/// Where a frame was obtained from, so a failed fill can put it back.
enum FrameSource {
    FreeList,
    Replacer,
}

impl BufferPoolManager {
    /// Creates a new buffer pool manager with a fixed number of frames.
    pub fn new(disk_manager: DiskManager, pool_size: usize) -> Self {
        let pages = vec![Page::new(); pool_size];
        let free_list = (0..pool_size).rev().collect();
        let state = BufferPoolState {
            disk_manager,
            replacer: ClockReplacer::new(pool_size),
            pages,
            page_table: HashMap::new(),
            free_list,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
            metrics: Arc::new(BufferPoolMetrics::default()),
        }
    }

    fn lock_state(&self) -> BufferPoolResult<MutexGuard<'_, BufferPoolState>> {
        self.inner.lock().map_err(|_| BufferPoolError::LockPoisoned)
    }

    /// Returns the number of page fetches since last reset.
    pub fn fetch_count(&self) -> usize {
        self.metrics.fetch_count.load(Ordering::Relaxed)
    }

    /// Resets the fetch counter to zero.
    pub fn reset_fetch_count(&self) {
        self.metrics.fetch_count.store(0, Ordering::Relaxed)
    }

    /// Takes a frame from the free list, or evicts a replacer victim.
    fn acquire_frame(state: &mut BufferPoolState) -> Option<(FrameId, FrameSource)> {
        if let Some(frame_id) = state.free_list.pop() {
            return Some((frame_id, FrameSource::FreeList));
        }
        state
            .replacer
            .victim()
            .map(|frame_id| (frame_id, FrameSource::Replacer))
    }

    /// Puts a frame back where `acquire_frame` found it after a failure.
    fn release_frame(state: &mut BufferPoolState, frame_id: FrameId, source: FrameSource) {
        match source {
            FrameSource::FreeList => state.free_list.push(frame_id),
            FrameSource::Replacer => state.replacer.unpin(frame_id),
        }
    }

    /// Writes back and unmaps whatever page currently occupies the frame.
    fn evict_if_needed(state: &mut BufferPoolState, frame_id: FrameId) -> BufferPoolResult<()> {
        let (disk_manager, pages, page_table) = (
            &mut state.disk_manager,
            &mut state.pages,
            &mut state.page_table,
        );
        if let Some(old_page_id) = pages[frame_id].page_id {
            if pages[frame_id].is_dirty {
                let data = pages[frame_id].bytes();
                disk_manager.write_page(old_page_id, data)?;
            }
            page_table.remove(&old_page_id);
            trace!(page_id = old_page_id, frame_id, "evicted page");
        }
        Ok(())
    }

    /// Allocates a new page on disk and pins it in the buffer pool.
    ///
    /// Returns the new page id together with a guard over the pinned frame
    /// so the caller can initialize the page under the same pin. `None`
    /// means every frame is pinned.
    pub fn new_page(&self) -> BufferPoolResult<Option<(PageId, PageGuard<'_>)>> {
        let mut state = self.lock_state()?;
        let Some((frame_id, source)) = Self::acquire_frame(&mut state) else {
            return Ok(None);
        };

        if let Err(err) = Self::evict_if_needed(&mut state, frame_id) {
            Self::release_frame(&mut state, frame_id, source);
            return Err(err);
        }
        // A free-listed frame must not carry the evicted page's state, so
        // clean the frame before the fallible allocation.
        state.pages[frame_id].reset();

        let page_id = match state.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(err) => {
                state.free_list.push(frame_id);
                return Err(err.into());
            }
        };
        {
            let page = &mut state.pages[frame_id];
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        debug!(page_id, frame_id, "allocated new page");
        Ok(Some((page_id, PageGuard { state, frame_id })))
    }

    /// Fetches a page into memory and pins it, returning a guarded reference.
    ///
    /// `None` means every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> BufferPoolResult<Option<PageGuard<'_>>> {
        debug_assert_ne!(page_id, INVALID_PAGE_ID);
        self.metrics.fetch_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock_state()?;
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            trace!(page_id, frame_id, "buffer pool hit");
            let page = &mut state.pages[frame_id];
            page.pin_count += 1;
            state.replacer.pin(frame_id);
            return Ok(Some(PageGuard { state, frame_id }));
        }

        debug!(page_id, "buffer pool miss, loading from disk");
        let Some((frame_id, source)) = Self::acquire_frame(&mut state) else {
            return Ok(None);
        };

        if let Err(err) = Self::evict_if_needed(&mut state, frame_id) {
            Self::release_frame(&mut state, frame_id, source);
            return Err(err);
        }
        {
            let state = &mut *state;
            let (disk_manager, pages) = (&mut state.disk_manager, &mut state.pages);
            let page = &mut pages[frame_id];
            page.reset();
            if let Err(err) = disk_manager.read_page(page_id, page.bytes_mut()) {
                // The frame is zeroed and unmapped; hand it back as free.
                state.free_list.push(frame_id);
                return Err(err.into());
            }
            page.page_id = Some(page_id);
            page.pin_count = 1;
        }
        state.page_table.insert(page_id, frame_id);
        state.replacer.pin(frame_id);
        Ok(Some(PageGuard { state, frame_id }))
    }

    /// Unpins a page and optionally marks it dirty.
    ///
    /// Returns false if the page is not resident or its pin count is
    /// already zero. A dirty flag set by an earlier unpin is never cleared.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> BufferPoolResult<bool> {
        debug_assert_ne!(page_id, INVALID_PAGE_ID);
        let mut state = self.lock_state()?;
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };
        let page = &mut state.pages[frame_id];
        if page.pin_count == 0 {
            return Ok(false);
        }
        if is_dirty {
            page.is_dirty = true;
        }
        page.pin_count -= 1;
        if page.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
        Ok(true)
    }

    /// Flushes a page to disk, if present.
    pub fn flush_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        debug_assert_ne!(page_id, INVALID_PAGE_ID);
        let mut state = self.lock_state()?;
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };
        let data = *state.pages[frame_id].bytes();
        // Write first: a failed write must leave the dirty flag intact.
        state.disk_manager.write_page(page_id, &data)?;
        state.pages[frame_id].is_dirty = false;
        Ok(true)
    }

    /// Flushes all resident dirty pages to disk.
    pub fn flush_all_pages(&self) -> BufferPoolResult<()> {
        let mut state = self.lock_state()?;
        let page_ids = state
            .pages
            .iter()
            .filter(|page| page.is_dirty)
            .filter_map(|page| page.page_id)
            .collect::<Vec<_>>();
        for page_id in page_ids {
            let frame_id = match state.page_table.get(&page_id) {
                Some(&frame_id) => frame_id,
                None => continue,
            };
            let data = *state.pages[frame_id].bytes();
            state.disk_manager.write_page(page_id, &data)?;
            state.pages[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Removes a page from the pool and deallocates it on disk.
    ///
    /// A page that is not resident was already deleted or never fetched;
    /// that is vacuous success. A pinned page cannot be deleted.
    pub fn delete_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        debug_assert_ne!(page_id, INVALID_PAGE_ID);
        let mut state = self.lock_state()?;
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(true),
        };
        if state.pages[frame_id].pin_count > 0 {
            return Ok(false);
        }
        state.page_table.remove(&page_id);
        state.pages[frame_id].reset();
        // Free-listed frames must not be replacer victims.
        state.replacer.pin(frame_id);
        state.free_list.push(frame_id);
        state.disk_manager.deallocate_page(page_id)?;
        debug!(page_id, frame_id, "deleted page");
        Ok(true)
    }
}
