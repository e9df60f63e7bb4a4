//! Fixed-size pool of latched frames holding the pages of every index.
//!
//! Frames are allocated once and reused, never returned to the allocator, so a remembered
//! [`BlockHint`] always points at valid memory. Whether the frame still holds the remembered page
//! in the remembered state is decided by comparing the page id and the modify clock after
//! latching.

use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;

use crate::error::{Error, Result};
use crate::latch::{ExclusiveGuard, HybridLatch, SharedGuard};
use crate::page::{Page, PageId, PageNo};

pub type FrameId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// A buffer frame. `page_id` is `None` while the frame is on the free list.
#[derive(Debug)]
pub struct Frame {
    page_id: Option<PageId>,
    page: Page,
}

/// Where a page was last seen: enough to try an optimistic re-latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHint {
    pub frame: FrameId,
    pub page_id: PageId,
}

enum FrameLatch<'p> {
    Shared(SharedGuard<'p, Frame>),
    Exclusive(ExclusiveGuard<'p, Frame>),
}

/// A latched page.
pub struct PageGuard<'p> {
    frame_id: FrameId,
    latch: FrameLatch<'p>,
}

impl<'p> PageGuard<'p> {
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn mode(&self) -> LatchMode {
        match self.latch {
            FrameLatch::Shared(_) => LatchMode::Shared,
            FrameLatch::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    /// The modify clock the page will show once this guard is gone.
    pub fn modify_clock(&self) -> usize {
        match &self.latch {
            FrameLatch::Shared(g) => g.version(),
            FrameLatch::Exclusive(g) => g.version_after_release(),
        }
    }

    pub fn hint(&self) -> BlockHint {
        BlockHint {
            frame: self.frame_id,
            page_id: self.page().id(),
        }
    }

    pub fn page(&self) -> &Page {
        match &self.latch {
            FrameLatch::Shared(g) => &g.page,
            FrameLatch::Exclusive(g) => &g.page,
        }
    }

    /// Mutable access to the page. Only valid under an exclusive latch.
    pub fn page_mut(&mut self) -> &mut Page {
        match &mut self.latch {
            FrameLatch::Exclusive(g) => &mut g.page,
            FrameLatch::Shared(_) => unreachable!("page modified under a shared latch"),
        }
    }

    fn frame_mut(&mut self) -> &mut Frame {
        match &mut self.latch {
            FrameLatch::Exclusive(g) => &mut **g,
            FrameLatch::Shared(_) => unreachable!("frame modified under a shared latch"),
        }
    }

    fn page_id(&self) -> Option<PageId> {
        match &self.latch {
            FrameLatch::Shared(g) => g.page_id,
            FrameLatch::Exclusive(g) => g.page_id,
        }
    }
}

impl<'p> Deref for PageGuard<'p> {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.page()
    }
}

impl<'p> std::fmt::Debug for PageGuard<'p> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("mode", &self.mode())
            .finish()
    }
}

pub struct BufferPool {
    frames: Box<[HybridLatch<Frame>]>,
    page_table: Mutex<HashMap<PageId, FrameId>>,
    free: Mutex<Vec<FrameId>>,
    next_page_no: Mutex<HashMap<u32, PageNo>>,
}

impl BufferPool {
    pub fn new(n_frames: usize) -> BufferPool {
        let frames = (0..n_frames)
            .map(|_| {
                HybridLatch::new(Frame {
                    page_id: None,
                    page: Page::new(PageId::new(0, 0), 0),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        BufferPool {
            frames,
            page_table: Mutex::new(HashMap::new()),
            free: Mutex::new((0..n_frames).rev().collect()),
            next_page_no: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames currently holding a page.
    pub fn n_used(&self) -> usize {
        self.page_table.lock().len()
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.lock().contains_key(&page_id)
    }

    fn guard(frame_id: FrameId, latch: FrameLatch<'_>, page_id: PageId) -> Option<PageGuard<'_>> {
        let guard = PageGuard { frame_id, latch };
        if guard.page_id() == Some(page_id) {
            Some(guard)
        } else {
            None
        }
    }

    /// Latches `page_id` in `mode`, waiting for the latch. `None` if the page is not resident.
    pub fn fetch(&self, page_id: PageId, mode: LatchMode) -> Option<PageGuard<'_>> {
        let frame_id = *self.page_table.lock().get(&page_id)?;
        let latch = &self.frames[frame_id];
        let latch = match mode {
            LatchMode::Shared => FrameLatch::Shared(latch.shared()),
            LatchMode::Exclusive => FrameLatch::Exclusive(latch.exclusive()),
        };
        // The frame may have been freed and reused between the lookup and the latch.
        Self::guard(frame_id, latch, page_id)
    }

    /// Like [`BufferPool::fetch`] but fails with [`Error::LockWouldBlock`] instead of waiting.
    pub fn try_fetch(&self, page_id: PageId, mode: LatchMode) -> Result<Option<PageGuard<'_>>> {
        let frame_id = match self.page_table.lock().get(&page_id) {
            Some(frame_id) => *frame_id,
            None => return Ok(None),
        };
        let latch = &self.frames[frame_id];
        let latch = match mode {
            LatchMode::Shared => latch.try_shared().map(FrameLatch::Shared),
            LatchMode::Exclusive => latch.try_exclusive().map(FrameLatch::Exclusive),
        }
        .ok_or(Error::LockWouldBlock)?;
        Ok(Self::guard(frame_id, latch, page_id))
    }

    /// Re-latches the frame in `hint` if it still holds the same page at the same modify clock.
    pub fn optimistic_fetch(
        &self,
        hint: BlockHint,
        modify_clock: usize,
        mode: LatchMode,
    ) -> Option<PageGuard<'_>> {
        let latch = self.frames.get(hint.frame)?.optimistic_at(modify_clock);
        let latch = match mode {
            LatchMode::Shared => FrameLatch::Shared(latch.to_shared().ok()?),
            LatchMode::Exclusive => FrameLatch::Exclusive(latch.to_exclusive().ok()?),
        };
        Self::guard(hint.frame, latch, hint.page_id)
    }

    /// Takes a free frame and formats a new, empty page in it. The page is returned latched
    /// exclusively.
    pub fn allocate(&self, space: u32, level: usize) -> Result<PageGuard<'_>> {
        let frame_id = self.free.lock().pop().ok_or(Error::OutOfMemory)?;
        let page_no = {
            let mut next = self.next_page_no.lock();
            let page_no = next.entry(space).or_insert(1);
            let allocated = *page_no;
            *page_no += 1;
            allocated
        };
        let page_id = PageId::new(space, page_no);

        let mut guard = PageGuard {
            frame_id,
            latch: FrameLatch::Exclusive(self.frames[frame_id].exclusive()),
        };
        let frame = guard.frame_mut();
        frame.page_id = Some(page_id);
        frame.page = Page::new(page_id, level);
        self.page_table.lock().insert(page_id, frame_id);

        trace!("allocated page {} in frame {}", page_id, frame_id);
        Ok(guard)
    }

    /// Drops the page held by an exclusively latched frame and returns the frame to the free
    /// list.
    pub fn free(&self, mut guard: PageGuard<'_>) {
        let frame_id = guard.frame_id;
        let frame = guard.frame_mut();
        let page_id = frame.page_id.take();
        frame.page.records.clear();
        frame.page.prev = None;
        frame.page.next = None;
        if let Some(page_id) = page_id {
            self.page_table.lock().remove(&page_id);
            trace!("freed page {} from frame {}", page_id, frame_id);
        }
        drop(guard);
        self.free.lock().push(frame_id);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("used", &self.n_used())
            .finish()
    }
}
