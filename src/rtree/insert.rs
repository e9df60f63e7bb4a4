use log::trace;

use super::{Mbr, NodeVisit, RtrCursor, SearchMode, SpatialKey};
use crate::btree::Index;
use crate::buffer::LatchMode;
use crate::error::{Error, Result};
use crate::mtr::Mtr;
use crate::page::{Page, PageNo, Record, Slot, Tuple};

/// Picks the child of `page` that receives an entry covering `mbr`. Returns its position and
/// the area its rectangle grows by.
///
/// The first child already covering the entry wins. Otherwise the child with the least
/// enlargement is taken. On the leftmost page of a level the first child is avoided whenever
/// another one is available, keeping inserts off the left edge of the tree.
fn choose_subtree(index: &Index, page: &Page, mbr: &Mbr) -> Result<(usize, f64)> {
    let avoid_first = page.prev().is_none() && page.n_recs() >= 2;
    let first = usize::from(avoid_first);

    let mut best: Option<(usize, f64)> = None;
    for (i, rec) in page.records().iter().enumerate().skip(first) {
        let ptr = rec
            .mbr
            .ok_or_else(|| index.corrupt(page, "spatial record without rectangle"))?;
        if ptr.contains(mbr) {
            return Ok((i, 0.0));
        }
        let (mut inc, area) = ptr.enlargement(mbr);
        // A zero growth without containment comes from degenerate rectangles: rank it behind
        // every real growth.
        if inc >= f64::MAX || (inc == 0.0 && area.is_finite()) {
            inc = f64::MAX / 2.0;
        }
        if best.map_or(true, |(_, least)| inc < least) {
            best = Some((i, inc));
        }
    }
    best.ok_or_else(|| index.corrupt(page, "non-leaf page without node pointer"))
}

impl Index {
    /// Inserts an entry into a spatial index. Fails with [`Error::DuplicateKey`] if an entry
    /// with the same rectangle and key exists on the leaf the entry is placed in.
    pub fn rtr_insert(&self, mbr: Mbr, key: Tuple, value: Vec<u8>) -> Result<()> {
        debug_assert!(self.is_spatial());
        let mut mtr = Mtr::new();
        mtr.x_lock_tree(self.lock());

        let mut path = vec![mtr.push(self.fetch_required(self.root(), LatchMode::Exclusive)?)];
        let mut visits = Vec::new();
        loop {
            let page = mtr.page(path[path.len() - 1]);
            if page.is_leaf() {
                break;
            }
            let (pos, inc) = choose_subtree(self, page, &mbr)?;
            let child = page.records()[pos]
                .child
                .ok_or_else(|| self.corrupt(page, "node pointer without child"))?;
            visits.push(NodeVisit {
                child_no: Some(child),
                mbr_inc: inc,
                ..NodeVisit::page(page.page_no(), self.current_ssn(), page.level())
            });
            path.push(mtr.push(self.fetch_required(child, LatchMode::Exclusive)?));
        }

        let leaf = mtr.page_mut(path[path.len() - 1]).page_mut();
        if leaf
            .records()
            .iter()
            .any(|rec| rec.mbr == Some(mbr) && rec.key == key)
        {
            return Err(Error::DuplicateKey);
        }
        leaf.records.push(Record::spatial(mbr, key, value));

        // Grow the node pointers on the path, bottom-up, until one already covers the entry.
        for (depth, visit) in visits.iter().enumerate().rev() {
            let parent = mtr.page_mut(path[depth]).page_mut();
            let pos = match visit.child_no.and_then(|child| parent.child_position(child)) {
                Some(pos) => pos,
                None => return Err(self.corrupt(parent, "missing node pointer")),
            };
            let ptr = parent.records[pos].mbr.unwrap_or(mbr);
            if ptr.contains(&mbr) {
                break;
            }
            trace!(
                "index {}: enlarging pointer to page {:?} by {}",
                self.name(),
                visit.child_no,
                visit.mbr_inc
            );
            parent.records[pos].mbr = Some(ptr.union(&mbr));
        }

        self.split_overflowing(&mut mtr, &path)?;
        mtr.commit();
        Ok(())
    }

    /// Removes the entry with rectangle `mbr` and `key`. Returns whether it existed.
    ///
    /// Pages left empty are discarded level by level, their node pointers found through the
    /// parent path of the locating search. Other running searches forget the discarded pages.
    pub fn rtr_delete(&self, mbr: Mbr, key: &Tuple) -> Result<bool> {
        debug_assert!(self.is_spatial());
        let search = RtrCursor::open(
            self,
            SpatialKey::entry(mbr, key.clone()),
            SearchMode::Locate,
            0,
            true,
            LatchMode::Exclusive,
        )?;

        let mut mtr = Mtr::new();
        mtr.x_lock_tree(self.lock());
        let cur = match search.getnext_from_path(&mut mtr)? {
            Some(cur) => cur,
            None => return Ok(false),
        };
        let pos = match cur.slot {
            Slot::Rec(pos) => pos,
            _ => return Err(self.corrupt(mtr.page(cur.sp), "located entry on a sentinel")),
        };
        mtr.page_mut(cur.sp).page_mut().remove(pos);

        let mut sp = cur.sp;
        let mut covered = mbr;
        loop {
            let (page_no, level, empty) = {
                let page = mtr.page(sp);
                (page.page_no(), page.level(), page.is_empty())
            };
            if !empty || page_no == self.root() {
                break;
            }

            // The page is released first: discarding latches its siblings left to right.
            mtr.release_at_savepoint(sp);
            let father = self.rtr_page_get_father(page_no, level, covered, Some(&search), &mut mtr)?;
            self.free_page(page_no, Some(&search.info.shared))?;

            let parent = mtr.page_mut(father.sp).page_mut();
            let ptr = match father.slot {
                Slot::Rec(pos) => parent.remove(pos),
                _ => return Err(self.corrupt(parent, "missing node pointer")),
            };
            covered = ptr.mbr.unwrap_or(covered);
            sp = father.sp;
        }

        if mtr.page(sp).page_no() == self.root() {
            self.collapse_empty_root(mtr.page_mut(sp).page_mut());
        }
        mtr.commit();
        Ok(true)
    }

    /// Moves the records of page `page_no` selected by `move_right` into a new right sibling.
    /// Returns the new page, or `None` if the selection would leave either half empty.
    #[cfg(test)]
    pub(crate) fn rtr_split_page_for_test(
        &self,
        page_no: PageNo,
        mut move_right: impl FnMut(&Record) -> bool,
    ) -> Result<Option<PageNo>> {
        let mut mtr = Mtr::new();
        mtr.x_lock_tree(self.lock());

        let (level, bounds, mask) = {
            let page = self.fetch_required(page_no, LatchMode::Shared)?;
            let mask: Vec<bool> = page.records().iter().map(&mut move_right).collect();
            (page.level(), page.union_mbr(), mask)
        };
        let moving = mask.iter().filter(|m| **m).count();
        let bounds = match bounds {
            Some(bounds) if moving > 0 && moving < mask.len() => bounds,
            _ => return Ok(None),
        };

        let father = self.rtr_page_get_father(page_no, level, bounds, None, &mut mtr)?;
        let sp = mtr.push(self.fetch_required(page_no, LatchMode::Exclusive)?);
        let right_sp = self.split_page(&mut mtr, sp, father.sp, |page| {
            let records = std::mem::take(&mut page.records);
            let (right, left): (Vec<_>, Vec<_>) =
                records.into_iter().zip(mask).partition(|(_, m)| *m);
            page.records = left.into_iter().map(|(rec, _)| rec).collect();
            right.into_iter().map(|(rec, _)| rec).collect()
        })?;
        let right = mtr.page(right_sp).page_no();
        mtr.commit();
        Ok(Some(right))
    }
}
