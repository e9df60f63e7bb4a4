//! Persistent cursors: positions that survive releasing their latches.
//!
//! A positioned cursor refers to a page latched in a mini-transaction. Storing it keeps the key
//! of the record it was on (or next to), the frame it was found in and the page modify clock.
//! Restoring first tries to re-latch that very frame; if the page was changed, evicted or
//! reused in between, the tree is searched again by key.

use log::trace;
use std::cmp::Ordering;

use crate::btree::{Index, PageCursor};
use crate::buffer::{BlockHint, LatchMode};
use crate::error::{Error, Result};
use crate::mtr::Mtr;
use crate::page::{Page, PageCurMode, Record, Slot, Tuple};

/// Where the cursor was relative to the stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelPos {
    On,
    /// Before the stored key: the cursor was on the infimum, the key is the first record's.
    Before,
    /// After the stored key: the cursor was on the supremum, the key is the last record's.
    After,
    BeforeFirstInTree,
    AfterLastInTree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosState {
    NotPositioned,
    Positioned,
    WasPositioned,
}

#[derive(Debug, Clone)]
pub struct PersistentCursor {
    level: usize,
    cur: PageCursor,
    state: PosState,
    rel_pos: RelPos,
    old_key: Option<Tuple>,
    hint: Option<BlockHint>,
    hint_slot: Slot,
    modify_clock: usize,
}

impl PersistentCursor {
    /// A cursor working on `level` of the tree.
    pub fn new(level: usize) -> PersistentCursor {
        PersistentCursor {
            level,
            cur: PageCursor {
                sp: 0,
                slot: Slot::Infimum,
            },
            state: PosState::NotPositioned,
            rel_pos: RelPos::On,
            old_key: None,
            hint: None,
            hint_slot: Slot::Infimum,
            modify_clock: 0,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn state(&self) -> PosState {
        self.state
    }

    pub fn rel_pos(&self) -> RelPos {
        self.rel_pos
    }

    /// The key prefix kept by the last store.
    pub fn old_key(&self) -> Option<&Tuple> {
        self.old_key.as_ref()
    }

    pub fn open<'a>(
        &mut self,
        index: &'a Index,
        tuple: &Tuple,
        mode: PageCurMode,
        latch: LatchMode,
        mtr: &mut Mtr<'a>,
    ) -> Result<()> {
        let cur = index.search_to_level(tuple, self.level, mode, latch, mtr)?;
        self.position(cur);
        Ok(())
    }

    pub fn open_at_side<'a>(
        &mut self,
        index: &'a Index,
        left: bool,
        latch: LatchMode,
        mtr: &mut Mtr<'a>,
    ) -> Result<()> {
        let cur = index.open_at_side(left, self.level, latch, mtr)?;
        self.position(cur);
        Ok(())
    }

    /// Places the cursor on a position of a page already latched in the caller's
    /// mini-transaction.
    pub fn position(&mut self, cur: PageCursor) {
        self.cur = cur;
        self.state = PosState::Positioned;
    }

    pub fn page_cursor(&self) -> PageCursor {
        self.cur
    }

    pub fn slot(&self) -> Slot {
        self.cur.slot
    }

    pub fn page<'m>(&self, mtr: &'m Mtr<'_>) -> &'m Page {
        debug_assert_eq!(self.state, PosState::Positioned);
        mtr.page(self.cur.sp).page()
    }

    pub fn record<'m>(&self, mtr: &'m Mtr<'_>) -> Option<&'m Record> {
        self.page(mtr).rec(self.cur.slot)
    }

    pub fn is_on_user_rec(&self) -> bool {
        self.cur.slot.is_user_rec()
    }

    pub fn is_after_last_on_page(&self) -> bool {
        self.cur.slot == Slot::Supremum
    }

    pub fn is_before_first_on_page(&self) -> bool {
        self.cur.slot == Slot::Infimum
    }

    pub fn move_to_next_on_page(&mut self, mtr: &Mtr<'_>) {
        self.cur.slot = self.page(mtr).next_slot(self.cur.slot);
    }

    pub fn move_to_prev_on_page(&mut self, mtr: &Mtr<'_>) {
        self.cur.slot = self.page(mtr).prev_slot(self.cur.slot);
    }

    /// Steps onto the infimum of the right sibling, latched like the current page. The right
    /// sibling is latched before the current page is released. Returns false on the last page
    /// of the level.
    pub fn move_to_next_page<'a>(&mut self, index: &'a Index, mtr: &mut Mtr<'a>) -> Result<bool> {
        let (next, mode) = {
            let guard = mtr.page(self.cur.sp);
            (guard.next(), guard.mode())
        };
        let next = match next {
            Some(next) => next,
            None => return Ok(false),
        };
        let guard = index.fetch_required(next, mode)?;
        let sp = mtr.push(guard);
        mtr.release_at_savepoint(self.cur.sp);
        self.cur = PageCursor {
            sp,
            slot: Slot::Infimum,
        };
        Ok(true)
    }

    /// Advances to the next user record, crossing pages as needed.
    pub fn move_to_next<'a>(&mut self, index: &'a Index, mtr: &mut Mtr<'a>) -> Result<bool> {
        loop {
            self.move_to_next_on_page(mtr);
            if self.is_on_user_rec() {
                return Ok(true);
            }
            if !self.move_to_next_page(index, mtr)? {
                return Ok(false);
            }
        }
    }

    /// Remembers the current position. The caller's mini-transaction keeps its latches; the
    /// cursor only becomes usable again through [`PersistentCursor::restore_position`].
    ///
    /// Leaf positions keep the index's unique key prefix, non-leaf positions the whole node
    /// pointer key. A position on a sentinel keeps the key of the neighbouring record.
    pub fn store_position(&mut self, index: &Index, mtr: &Mtr<'_>) {
        debug_assert_eq!(self.state, PosState::Positioned);
        let guard = mtr.page(self.cur.sp);
        let page = guard.page();
        debug_assert!(!page.is_empty() || page.page_no() == index.root());

        let n_fields = if page.is_leaf() {
            index.n_unique()
        } else {
            usize::MAX
        };
        let (rel_pos, rec) = match self.cur.slot {
            Slot::Rec(i) => (RelPos::On, page.records().get(i)),
            Slot::Supremum if page.is_empty() => (RelPos::AfterLastInTree, None),
            Slot::Infimum if page.is_empty() => (RelPos::BeforeFirstInTree, None),
            Slot::Supremum => (RelPos::After, page.records().last()),
            Slot::Infimum => (RelPos::Before, page.records().first()),
        };

        self.rel_pos = rel_pos;
        self.old_key = rec.map(|rec| rec.key.prefix(n_fields));
        self.hint = Some(guard.hint());
        self.hint_slot = self.cur.slot;
        self.modify_clock = guard.modify_clock();
        self.state = PosState::WasPositioned;
    }

    /// Forgets the frame the position was stored in, so the next restore searches from the
    /// root.
    pub fn clear_hint(&mut self) {
        self.hint = None;
    }

    /// Re-latches the stored frame if it still holds the page, unchanged.
    pub(crate) fn optimistic_restore<'a>(
        &self,
        index: &'a Index,
        latch: LatchMode,
        mtr: &mut Mtr<'a>,
    ) -> Option<PageCursor> {
        let hint = self.hint?;
        let guard = index
            .pool()
            .optimistic_fetch(hint, self.modify_clock, latch)?;
        Some(PageCursor {
            sp: mtr.push(guard),
            slot: self.hint_slot,
        })
    }

    /// Repositions the cursor, latching its page in `latch` mode.
    ///
    /// Returns true only when the cursor is back on the very record it was stored on. Otherwise
    /// a stored `On` position lands on the greatest record not above the key, or on the infimum
    /// when there is none on that page; `After` lands on the first record above the key or a
    /// supremum; `Before` on the last record below it or an infimum.
    pub fn restore_position<'a>(
        &mut self,
        index: &'a Index,
        latch: LatchMode,
        mtr: &mut Mtr<'a>,
    ) -> Result<bool> {
        debug_assert_eq!(self.state, PosState::WasPositioned);

        let mode = match self.rel_pos {
            RelPos::BeforeFirstInTree | RelPos::AfterLastInTree => {
                let left = self.rel_pos == RelPos::BeforeFirstInTree;
                let cur = index.open_at_side(left, self.level, latch, mtr)?;
                self.position(cur);
                return Ok(false);
            }
            RelPos::On => PageCurMode::Le,
            RelPos::After => PageCurMode::G,
            RelPos::Before => PageCurMode::L,
        };

        if let Some(cur) = self.optimistic_restore(index, latch, mtr) {
            self.position(cur);
            return Ok(self.rel_pos == RelPos::On);
        }

        let key = self
            .old_key
            .clone()
            .ok_or_else(|| Error::Corruption("cursor stored without a key".to_string()))?;
        trace!(
            "index {}: pessimistic restore of {:?} {} at level {}",
            index.name(),
            self.rel_pos,
            key,
            self.level
        );
        let cur = index.search_to_level(&key, self.level, mode, latch, mtr)?;
        self.position(cur);

        Ok(self.rel_pos == RelPos::On
            && self
                .record(mtr)
                .map_or(false, |rec| key.compare(&rec.key) == Ordering::Equal))
    }
}
