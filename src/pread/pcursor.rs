use log::{trace, warn};
use parking_lot_core::SpinWait;
use std::thread;

use crate::btree::{Index, PageCursor};
use crate::buffer::LatchMode;
use crate::error::{Error, Result};
use crate::latch::TreeSharedGuard;
use crate::mtr::Mtr;
use crate::page::{Page, Record, Slot};
use crate::pcur::{PersistentCursor, RelPos};

/// Cursor walking one level of the tree page by page on behalf of a scan context.
///
/// Only the current page stays latched. At page boundaries the cursor gives way to threads
/// waiting for the tree lock by storing its position, yielding and restoring it. Above the leaf
/// level the tree lock is held in shared mode while the cursor is restored or steps to the next
/// page, never in between.
pub(crate) struct PCursor<'a> {
    index: &'a Index,
    mtr: Mtr<'a>,
    pcur: PersistentCursor,
    read_level: usize,
    level_one_retries: usize,
}

impl<'a> PCursor<'a> {
    pub fn new(index: &'a Index, pcur: PersistentCursor, level_one_retries: usize) -> PCursor<'a> {
        let read_level = pcur.level();
        let mut mtr = Mtr::new();
        mtr.commit();
        PCursor {
            index,
            mtr,
            pcur,
            read_level,
            level_one_retries,
        }
    }

    pub fn page(&self) -> &Page {
        self.pcur.page(&self.mtr)
    }

    pub fn slot(&self) -> Slot {
        self.pcur.slot()
    }

    pub fn record(&self) -> Option<&Record> {
        self.pcur.record(&self.mtr)
    }

    pub fn is_before_first_on_page(&self) -> bool {
        self.pcur.is_before_first_on_page()
    }

    pub fn is_after_last_on_page(&self) -> bool {
        self.pcur.is_after_last_on_page()
    }

    pub fn move_to_next_on_page(&mut self) {
        self.pcur.move_to_next_on_page(&self.mtr);
    }

    pub fn commit(&mut self) {
        if self.mtr.is_active() {
            self.mtr.commit();
        }
    }

    /// Non-leaf pages are only latched under the tree lock.
    fn tree_s_lock(&self) -> Option<TreeSharedGuard<'a>> {
        if self.read_level == 0 {
            None
        } else {
            Some(self.index.lock().shared())
        }
    }

    fn restore(&mut self) -> Result<bool> {
        let _tree = self.tree_s_lock();
        if !self.mtr.is_active() {
            self.mtr.start();
        }
        self.pcur
            .restore_position(self.index, LatchMode::Shared, &mut self.mtr)
    }

    /// Positions the cursor on the first record of the range it was stored for.
    pub fn restore_to_range_start(&mut self) -> Result<()> {
        let same = self.restore()?;
        if self.pcur.rel_pos() == RelPos::On && !same {
            // The start record is gone: the cursor is on its predecessor.
            self.move_to_next_on_page();
        }
        Ok(())
    }

    /// Stores the cursor, which is past the last record of its page, and releases its latch.
    fn save_previous_user_record_as_last_processed(&mut self) {
        debug_assert!(self.is_after_last_on_page());
        self.pcur.store_position(self.index, &self.mtr);
        self.mtr.commit();
    }

    /// Lands on the first record above the last one processed, or past the last record of a
    /// page.
    fn restore_to_first_unprocessed(&mut self) -> Result<()> {
        debug_assert_eq!(self.pcur.rel_pos(), RelPos::After);
        self.restore()?;
        Ok(())
    }

    fn save_level_one_progress(&mut self) {
        self.pcur.move_to_prev_on_page(&self.mtr);
        self.pcur.store_position(self.index, &self.mtr);
        self.mtr.commit();
    }

    fn restore_level_one_progress(&mut self) -> Result<()> {
        // On the last record processed or, if it is gone, before its successor.
        self.restore()?;
        self.move_to_next_on_page();
        Ok(())
    }

    /// Moves to the first record of the next non-empty page of the level. Leaf pages are always
    /// latched with waiting; non-leaf pages only when `blocking`, otherwise a busy page fails
    /// with [`Error::LockWouldBlock`] and the cursor stays where it was.
    pub fn step_to_next_page(&mut self, blocking: bool) -> Result<()> {
        let _tree = self.tree_s_lock();
        loop {
            let cur = self.pcur.page_cursor();
            let next = match self.mtr.page(cur.sp).next() {
                Some(next) => next,
                None => {
                    self.mtr.commit();
                    return Err(Error::EndOfIndex);
                }
            };

            let guard = if self.read_level == 0 || blocking {
                self.index.fetch_required(next, LatchMode::Shared)?
            } else {
                let page_id = self.index.page_id(next);
                self.index
                    .pool()
                    .try_fetch(page_id, LatchMode::Shared)?
                    .ok_or(Error::PageNotFound(page_id))?
            };

            let sp = self.mtr.push(guard);
            self.mtr.release_at_savepoint(cur.sp);
            self.pcur.position(PageCursor {
                sp,
                slot: Slot::Infimum,
            });
            self.move_to_next_on_page();
            if !self.is_after_last_on_page() {
                return Ok(());
            }
        }
    }

    /// Moves from past the last record of a page to the next record to process.
    pub fn move_to_next_block(&mut self) -> Result<()> {
        debug_assert!(self.is_after_last_on_page());
        if self.read_level == 0 {
            self.move_to_next_block_at_leaf_level()
        } else {
            self.move_to_next_block_at_level_one()
        }
    }

    fn move_to_next_block_at_leaf_level(&mut self) -> Result<()> {
        if self.index.lock().has_waiters() {
            self.save_previous_user_record_as_last_processed();
            trace!(
                "index {}: scan yields to waiting tree lock after {:?}",
                self.index.name(),
                self.pcur.old_key()
            );
            thread::yield_now();
            self.restore_to_first_unprocessed()?;
            if !self.is_after_last_on_page() {
                return Ok(());
            }
        }
        self.step_to_next_page(true)
    }

    /// The page latch is given up before the tree lock is waited for: a writer holding the tree
    /// lock exclusively may be waiting for that latch.
    fn move_to_next_block_at_level_one(&mut self) -> Result<()> {
        self.save_level_one_progress();
        if self.index.lock().has_waiters() {
            thread::yield_now();
        }
        let _tree = self.tree_s_lock();
        self.restore_level_one_progress()?;
        if !self.is_after_last_on_page() {
            return Ok(());
        }

        let mut retries = 0;
        let mut spin = SpinWait::new();
        loop {
            match self.step_to_next_page(false) {
                Err(Error::LockWouldBlock) => {}
                other => return other,
            }

            if retries >= self.level_one_retries {
                warn!(
                    "index {}: next page at level {} still busy after {} retries, waiting",
                    self.index.name(),
                    self.read_level,
                    retries
                );
                return self.step_to_next_page(true);
            }

            self.save_level_one_progress();
            // The stored frame may be the busy one.
            self.pcur.clear_hint();
            if !spin.spin() {
                thread::yield_now();
            }
            self.restore_level_one_progress()?;
            retries += 1;

            if !self.is_after_last_on_page() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageNo;
    use crate::util::{btree, int_rec, key};
    use serial_test::serial;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn tall_tree() -> Index {
        let index = btree(4, 1);
        for k in 0..400 {
            index.insert(int_rec(k)).unwrap();
        }
        assert!(index.height().unwrap() >= 3);
        index
    }

    /// A cursor past the last record of the first page of `level`.
    fn at_end_of_first_page(index: &Index, level: usize, retries: usize) -> PCursor<'_> {
        let mut pcur = PersistentCursor::new(level);
        let mut mtr = Mtr::new();
        pcur.open_at_side(index, true, LatchMode::Shared, &mut mtr).unwrap();
        pcur.store_position(index, &mtr);
        mtr.commit();

        let mut cursor = PCursor::new(index, pcur, retries);
        cursor.restore_to_range_start().unwrap();
        while !cursor.is_after_last_on_page() {
            cursor.move_to_next_on_page();
        }
        cursor
    }

    fn first_key_of(index: &Index, page_no: PageNo) -> crate::page::Tuple {
        let guard = index.fetch(page_no, LatchMode::Shared).unwrap();
        guard.records()[0].key.clone()
    }

    #[test]
    fn level_one_step_does_not_wait() {
        let index = tall_tree();
        let pages = index.pages_at_level(1).unwrap();
        let mut cursor = at_end_of_first_page(&index, 1, 3);
        assert_eq!(cursor.page().page_no(), pages[0]);

        let busy = index.fetch(pages[1], LatchMode::Exclusive).unwrap();
        assert_eq!(cursor.step_to_next_page(false), Err(Error::LockWouldBlock));
        assert_eq!(cursor.page().page_no(), pages[0]);
        assert!(cursor.is_after_last_on_page());
        drop(busy);

        cursor.step_to_next_page(false).unwrap();
        assert_eq!(cursor.page().page_no(), pages[1]);
        assert_eq!(cursor.record().unwrap().key, first_key_of(&index, pages[1]));
    }

    #[test]
    #[serial]
    fn level_one_retries_then_waits() {
        let index = Arc::new(tall_tree());
        let pages = index.pages_at_level(1).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let holder = {
            let index = index.clone();
            let barrier = barrier.clone();
            let page_no = pages[1];
            std::thread::spawn(move || {
                let busy = index.fetch(page_no, LatchMode::Exclusive).unwrap();
                barrier.wait();
                std::thread::sleep(Duration::from_millis(50));
                drop(busy);
            })
        };

        barrier.wait();
        let mut cursor = at_end_of_first_page(&index, 1, 2);
        cursor.move_to_next_block().unwrap();
        assert_eq!(cursor.page().page_no(), pages[1]);
        assert_eq!(cursor.record().unwrap().key, first_key_of(&index, pages[1]));
        cursor.commit();
        holder.join().unwrap();
    }

    #[test]
    #[serial]
    fn leaf_scan_yields_to_waiting_writer() {
        let index = Arc::new(tall_tree());
        let leaves = index.pages_at_level(0).unwrap();
        index.lock().lock_shared_raw();

        let writer = {
            let index = index.clone();
            std::thread::spawn(move || {
                let _x = index.lock().exclusive();
            })
        };
        while !index.lock().has_waiters() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut cursor = at_end_of_first_page(&index, 0, 0);
        cursor.move_to_next_block().unwrap();
        assert_eq!(cursor.page().page_no(), leaves[1]);
        assert_eq!(cursor.record().unwrap().key, first_key_of(&index, leaves[1]));
        cursor.commit();

        unsafe { index.lock().unlock_shared_raw() };
        writer.join().unwrap();
    }

    #[test]
    fn last_page_ends_the_index() {
        let index = btree(8, 1);
        for k in 0..5 {
            index.insert(int_rec(k)).unwrap();
        }
        let mut cursor = at_end_of_first_page(&index, 0, 0);
        assert_eq!(cursor.move_to_next_block(), Err(Error::EndOfIndex));
    }

    #[test]
    fn start_record_deleted_moves_to_successor() {
        let index = tall_tree();
        let mut pcur = PersistentCursor::new(0);
        let mut mtr = Mtr::new();
        pcur.open(&index, &key(100), crate::page::PageCurMode::Ge, LatchMode::Shared, &mut mtr)
            .unwrap();
        pcur.store_position(&index, &mtr);
        mtr.commit();
        index.delete(&key(100)).unwrap();

        let mut cursor = PCursor::new(&index, pcur, 0);
        cursor.restore_to_range_start().unwrap();
        if cursor.is_after_last_on_page() {
            cursor.move_to_next_block().unwrap();
        }
        assert_eq!(cursor.record().unwrap().key, key(101));
    }
}
