use log::trace;

use super::{MatchedRecs, Mbr, NodeVisit, RtrInfo, SearchMode, Strategy};
use crate::btree::{Index, PageCursor};
use crate::buffer::LatchMode;
use crate::error::{Error, Result};
use crate::mtr::{Mtr, Savepoint};
use crate::page::{PageNo, PageSnapshot, Record, Slot, Tuple};
use crate::pcur::PersistentCursor;

/// What a spatial search compares records against.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialKey {
    pub mbr: Mbr,
    /// Key of the entry, for locating one exact entry.
    pub key: Option<Tuple>,
    /// Child page, for locating the node pointer to it.
    pub child: Option<PageNo>,
}

impl SpatialKey {
    pub fn mbr(mbr: Mbr) -> SpatialKey {
        SpatialKey {
            mbr,
            key: None,
            child: None,
        }
    }

    pub fn entry(mbr: Mbr, key: Tuple) -> SpatialKey {
        SpatialKey {
            key: Some(key),
            ..SpatialKey::mbr(mbr)
        }
    }

    pub fn node_ptr(mbr: Mbr, child: PageNo) -> SpatialKey {
        SpatialKey {
            child: Some(child),
            ..SpatialKey::mbr(mbr)
        }
    }
}

/// An open spatial search.
///
/// The search holds no latch between calls: each step takes the tree lock in shared mode,
/// visits queued pages until one yields matches, and releases everything again.
pub struct RtrCursor<'a> {
    pub(crate) info: RtrInfo<'a>,
    query: SpatialKey,
    strategy: Strategy,
    target_level: usize,
    latch: LatchMode,
    /// Locating searches pass over delete-marked entries.
    skip_deleted: bool,
}

impl Index {
    /// Opens a search for the leaf entries matching `query` in `mode`.
    pub fn rtr_open(&self, query: Mbr, mode: SearchMode) -> Result<RtrCursor<'_>> {
        RtrCursor::open(self, SpatialKey::mbr(query), mode, 0, false, LatchMode::Shared)
    }

    /// The entry with rectangle `mbr` and `key`. Delete-marked entries are found only without
    /// `skip_deleted`.
    pub fn rtr_locate(&self, mbr: Mbr, key: &Tuple, skip_deleted: bool) -> Result<Option<Record>> {
        let mut search = RtrCursor::open(
            self,
            SpatialKey::entry(mbr, key.clone()),
            SearchMode::Locate,
            0,
            false,
            LatchMode::Shared,
        )?;
        search.skip_deleted = skip_deleted;

        let mut mtr = Mtr::new();
        let found = search
            .getnext_from_path(&mut mtr)?
            .and_then(|cur| mtr.page(cur.sp).rec(cur.slot).cloned());
        mtr.commit();
        Ok(found)
    }

    /// Sets or clears the delete mark of the entry with rectangle `mbr` and `key`. Returns
    /// whether the entry exists. Searches skip delete-marked entries.
    pub fn rtr_delete_mark(&self, mbr: Mbr, key: &Tuple, deleted: bool) -> Result<bool> {
        debug_assert!(self.is_spatial());
        let search = RtrCursor::open(
            self,
            SpatialKey::entry(mbr, key.clone()),
            SearchMode::Locate,
            0,
            false,
            LatchMode::Exclusive,
        )?;

        let mut mtr = Mtr::new();
        let marked = match search.getnext_from_path(&mut mtr)? {
            Some(PageCursor {
                sp,
                slot: Slot::Rec(pos),
            }) => {
                mtr.page_mut(sp).page_mut().records[pos].deleted = deleted;
                true
            }
            Some(cur) => return Err(self.corrupt(mtr.page(cur.sp), "located entry on a sentinel")),
            None => false,
        };
        mtr.commit();
        Ok(marked)
    }

    /// Finds and latches exclusively the node pointer to `child`, a page on `child_level`.
    ///
    /// `mbr` is any rectangle covered by the child, e.g. one of its records. The parent path of
    /// `search` is tried first; it survives splits of the parent through its split sequence
    /// number. Without a usable parent path entry the pointer is searched from the root. The
    /// caller holds the tree lock in `mtr`.
    pub fn rtr_page_get_father<'a>(
        &'a self,
        child: PageNo,
        child_level: usize,
        mbr: Mbr,
        search: Option<&RtrCursor<'a>>,
        mtr: &mut Mtr<'a>,
    ) -> Result<PageCursor> {
        debug_assert!(mtr.has_tree_lock());
        if let Some(search) = search {
            let visit = {
                let paths = search.info.shared.paths.lock();
                paths
                    .parent_path
                    .iter()
                    .rev()
                    .find(|visit| visit.child_no == Some(child))
                    .cloned()
            };
            if let Some(visit) = visit {
                if let Some(cur) = self.rtr_restore_parent(&visit, mtr)? {
                    return Ok(cur);
                }
            }
        }

        let father = RtrCursor::open(
            self,
            SpatialKey::node_ptr(mbr, child),
            SearchMode::GetFather,
            child_level + 1,
            false,
            LatchMode::Exclusive,
        )?;
        father.getnext_from_path(mtr)?.ok_or_else(|| {
            Error::Corruption(format!(
                "no node pointer to page {} in index {}",
                child,
                self.name()
            ))
        })
    }

    /// Re-latches the node pointer remembered by a parent path entry.
    ///
    /// The stored position is used if its page did not change. Otherwise the remembered parent
    /// page is searched for the pointer, moving right while the page visited was split after the
    /// entry was recorded.
    pub(crate) fn rtr_restore_parent<'a>(
        &'a self,
        visit: &NodeVisit,
        mtr: &mut Mtr<'a>,
    ) -> Result<Option<PageCursor>> {
        let (cursor, child) = match (&visit.cursor, visit.child_no) {
            (Some(cursor), Some(child)) => (cursor, child),
            _ => return Ok(None),
        };

        if let Some(cur) = cursor.optimistic_restore(self, LatchMode::Exclusive, mtr) {
            if mtr.page(cur.sp).rec(cur.slot).and_then(|rec| rec.child) == Some(child) {
                return Ok(Some(cur));
            }
            mtr.release_at_savepoint(cur.sp);
        }

        let mut page_no = visit.page_no;
        loop {
            let guard = match self.fetch(page_no, LatchMode::Exclusive) {
                Some(guard) => guard,
                None => return Ok(None),
            };
            if let Some(pos) = guard.child_position(child) {
                return Ok(Some(PageCursor {
                    sp: mtr.push(guard),
                    slot: Slot::Rec(pos),
                }));
            }
            match guard.next() {
                Some(next) if guard.ssn() > visit.seq_no => {
                    trace!(
                        "index {}: parent page {} split, following to {}",
                        self.name(),
                        page_no,
                        next
                    );
                    page_no = next;
                }
                _ => return Ok(None),
            }
        }
    }
}

impl<'a> RtrCursor<'a> {
    pub(crate) fn open(
        index: &'a Index,
        query: SpatialKey,
        mode: SearchMode,
        target_level: usize,
        need_parent: bool,
        latch: LatchMode,
    ) -> Result<RtrCursor<'a>> {
        debug_assert!(index.is_spatial());
        let info = RtrInfo::new(index, need_parent);
        let root_level = index
            .fetch_required(index.root(), LatchMode::Shared)?
            .level();
        info.shared.paths.lock().path.push(NodeVisit::page(
            index.root(),
            index.current_ssn(),
            root_level,
        ));

        Ok(RtrCursor {
            info,
            query,
            strategy: Strategy::new(mode),
            target_level,
            latch,
            skip_deleted: false,
        })
    }

    pub fn mode(&self) -> SearchMode {
        self.strategy.mode()
    }

    /// The next matching leaf entry, `None` once the search is exhausted.
    pub fn next(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(rec) = self.info.shared.matches.lock().pop() {
                return Ok(Some(rec));
            }
            let mut mtr = Mtr::new();
            let found = self.getnext_from_path(&mut mtr)?;
            mtr.commit();
            if found.is_none() {
                return Ok(None);
            }
        }
    }

    /// Drains the search.
    pub fn collect_all(mut self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        while let Some(rec) = self.next()? {
            out.push(rec);
        }
        Ok(out)
    }

    /// Pages still queued for a visit.
    pub fn queued_pages(&self) -> Vec<PageNo> {
        self.info
            .shared
            .paths
            .lock()
            .path
            .iter()
            .map(|visit| visit.page_no)
            .collect()
    }

    pub fn n_matched(&self) -> usize {
        self.info.shared.matches.lock().len()
    }

    /// Visits queued pages until one on the target level qualifies.
    ///
    /// For the modes locating one entry the qualifying record stays latched in `mtr` and its
    /// position is returned. For the others the matches of the leaf were copied to the matched
    /// records buffer and the returned position is that of the page.
    pub(crate) fn getnext_from_path(&self, mtr: &mut Mtr<'a>) -> Result<Option<PageCursor>> {
        let index = self.info.index();
        if !mtr.has_tree_lock() {
            mtr.s_lock_tree(index.lock());
        }

        loop {
            let visit = match self.info.shared.paths.lock().path.pop() {
                Some(visit) => visit,
                None => return Ok(None),
            };

            // A page freed since it was queued is no longer of interest.
            let mut guard = match index.fetch(visit.page_no, LatchMode::Shared) {
                Some(guard) => guard,
                None => continue,
            };
            if guard.level() == self.target_level && self.latch == LatchMode::Exclusive {
                drop(guard);
                guard = match index.fetch(visit.page_no, LatchMode::Exclusive) {
                    Some(guard) => guard,
                    None => continue,
                };
            }

            if guard.ssn() > visit.seq_no {
                if let Some(next) = guard.next() {
                    trace!(
                        "index {}: page {} split since queued, also visiting {}",
                        index.name(),
                        visit.page_no,
                        next
                    );
                    self.info.shared.paths.lock().path.push(NodeVisit::page(
                        next,
                        visit.seq_no,
                        guard.level(),
                    ));
                }
            }

            let level = guard.level();
            let sp = mtr.push(guard);

            if level == self.target_level && self.mode().is_locate() {
                if let Some(slot) = self.find_exact(mtr, sp)? {
                    return Ok(Some(PageCursor { sp, slot }));
                }
            } else if self.search_with_match(mtr, sp)? && level == self.target_level {
                return Ok(Some(PageCursor {
                    sp,
                    slot: Slot::Infimum,
                }));
            }
            mtr.release_at_savepoint(sp);
        }
    }

    /// The one record a locating search looks for.
    fn find_exact(&self, mtr: &Mtr<'a>, sp: Savepoint) -> Result<Option<Slot>> {
        let page = mtr.page(sp);
        let at_leaf = page.is_leaf();
        for (i, rec) in page.records().iter().enumerate() {
            let mbr = rec
                .mbr
                .ok_or_else(|| self.info.index().corrupt(page, "spatial record without rectangle"))?;
            let hit = match self.mode() {
                SearchMode::GetFather => {
                    rec.child == self.query.child
                        && self.strategy.evaluate(&self.query.mbr, &mbr, false)
                }
                _ => {
                    self.strategy.evaluate(&self.query.mbr, &mbr, at_leaf)
                        && self.query.key.as_ref() == Some(&rec.key)
                        && !(self.skip_deleted && rec.deleted)
                }
            };
            if hit {
                return Ok(Some(Slot::Rec(i)));
            }
        }
        Ok(None)
    }

    /// Evaluates the search predicate on every record of the page at `sp`. Matching node
    /// pointers are queued, matching leaf records copied to the matched records buffer.
    fn search_with_match(&self, mtr: &Mtr<'a>, sp: Savepoint) -> Result<bool> {
        let index = self.info.index();
        let guard = mtr.page(sp);
        let page = guard.page();
        let at_leaf = page.is_leaf();
        let ssn = index.current_ssn();

        let mut children = Vec::new();
        let mut parents = Vec::new();
        let mut snapshot: Option<PageSnapshot> = None;

        for (i, rec) in page.records().iter().enumerate() {
            let mbr = rec
                .mbr
                .ok_or_else(|| index.corrupt(page, "spatial record without rectangle"))?;
            if !self.strategy.evaluate(&self.query.mbr, &mbr, at_leaf) {
                continue;
            }

            if at_leaf {
                if rec.deleted {
                    continue;
                }
                snapshot
                    .get_or_insert_with(|| PageSnapshot::header(page, guard.modify_clock()))
                    .records
                    .push(rec.clone());
                continue;
            }

            let child = rec
                .child
                .ok_or_else(|| index.corrupt(page, "node pointer without child"))?;
            children.push(NodeVisit::page(child, ssn, page.level() - 1));

            if self.info.need_parent && self.mode().is_locate() {
                let mut cursor = PersistentCursor::new(page.level());
                cursor.position(PageCursor {
                    sp,
                    slot: Slot::Rec(i),
                });
                cursor.store_position(index, mtr);
                parents.push(NodeVisit {
                    child_no: Some(child),
                    cursor: Some(cursor),
                    ..NodeVisit::page(page.page_no(), ssn, page.level())
                });
            }
        }

        let found = !children.is_empty() || snapshot.is_some();
        if !children.is_empty() || !parents.is_empty() {
            let mut paths = self.info.shared.paths.lock();
            paths.path.extend(children);
            paths.parent_path.extend(parents);
        }
        if let Some(snapshot) = snapshot {
            *self.info.shared.matches.lock() = MatchedRecs {
                snapshot: Some(snapshot),
                valid: true,
            };
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{init_log, rtree, spatial_entries};
    use std::collections::BTreeSet;

    fn keys_of(records: &[Record]) -> BTreeSet<Tuple> {
        records.iter().map(|rec| rec.key.clone()).collect()
    }

    fn brute_force(entries: &[(Mbr, Tuple)], query: &Mbr, mode: SearchMode) -> BTreeSet<Tuple> {
        let strategy = Strategy::new(mode);
        entries
            .iter()
            .filter(|(mbr, _)| strategy.evaluate(query, mbr, true))
            .map(|(_, key)| key.clone())
            .collect()
    }

    #[test]
    fn every_mode_matches_brute_force() {
        init_log();
        let index = rtree(6);
        let entries = spatial_entries(400, 7);
        for (mbr, key) in &entries {
            index.rtr_insert(*mbr, key.clone(), vec![]).unwrap();
        }
        index.validate().unwrap();
        assert!(index.height().unwrap() >= 3);

        let queries = [
            Mbr::new(10.0, 10.0, 40.0, 60.0),
            Mbr::new(0.0, 0.0, 100.0, 100.0),
            Mbr::new(55.0, 55.0, 56.0, 56.0),
            entries[17].0,
        ];
        let modes = [
            SearchMode::Contain,
            SearchMode::Intersect,
            SearchMode::Within,
            SearchMode::Disjoint,
            SearchMode::Equal,
        ];
        for query in &queries {
            for mode in modes {
                let found = index.rtr_open(*query, mode).unwrap().collect_all().unwrap();
                assert_eq!(
                    found.len(),
                    keys_of(&found).len(),
                    "duplicate results for {:?}",
                    mode
                );
                assert_eq!(keys_of(&found), brute_force(&entries, query, mode), "{:?}", mode);
            }
        }
        assert_eq!(index.rtr_track.n_active(), 0);
    }

    #[test]
    fn delete_marked_entries_are_skipped() {
        let index = rtree(4);
        let entries = spatial_entries(60, 5);
        for (mbr, key) in &entries {
            index.rtr_insert(*mbr, key.clone(), vec![]).unwrap();
        }
        let everything = Mbr::new(-1.0, -1.0, 101.0, 101.0);
        let (mbr, key) = entries[23].clone();

        assert!(index.rtr_delete_mark(mbr, &key, true).unwrap());
        assert!(!index
            .rtr_delete_mark(Mbr::new(200.0, 200.0, 201.0, 201.0), &key, true)
            .unwrap());

        let found = index.rtr_open(everything, SearchMode::Intersect).unwrap().collect_all().unwrap();
        assert_eq!(found.len(), 59);
        assert!(!keys_of(&found).contains(&key));
        let hits = index.rtr_open(mbr, SearchMode::Equal).unwrap().collect_all().unwrap();
        assert!(hits.iter().all(|rec| rec.key != key));

        assert!(index.rtr_locate(mbr, &key, true).unwrap().is_none());
        let marked = index.rtr_locate(mbr, &key, false).unwrap().unwrap();
        assert!(marked.deleted);
        assert_eq!(marked.mbr, Some(mbr));
        // Still physically there.
        assert_eq!(index.scan_all().unwrap().len(), 60);

        assert!(index.rtr_delete_mark(mbr, &key, false).unwrap());
        assert!(!index.rtr_locate(mbr, &key, true).unwrap().unwrap().deleted);
        let found = index.rtr_open(everything, SearchMode::Intersect).unwrap().collect_all().unwrap();
        assert_eq!(keys_of(&found), entries.iter().map(|(_, key)| key.clone()).collect());

        // A marked entry can still be removed.
        assert!(index.rtr_delete_mark(mbr, &key, true).unwrap());
        assert!(index.rtr_delete(mbr, &key).unwrap());
        assert!(index.rtr_locate(mbr, &key, false).unwrap().is_none());
        index.validate().unwrap();
    }

    #[test]
    fn split_during_search_is_followed() {
        init_log();
        let index = rtree(8);
        let entries = spatial_entries(300, 11);
        for (mbr, key) in &entries {
            index.rtr_insert(*mbr, key.clone(), vec![]).unwrap();
        }
        let query = Mbr::new(0.0, 0.0, 70.0, 70.0);
        let expected = brute_force(&entries, &query, SearchMode::Intersect);

        let mut cursor = index.rtr_open(query, SearchMode::Intersect).unwrap();
        let mut found = vec![cursor.next().unwrap().unwrap()];

        // Split every queued leaf behind the search's back.
        let leaves: Vec<PageNo> = index.pages_at_level(0).unwrap();
        let queued: Vec<PageNo> = cursor
            .queued_pages()
            .into_iter()
            .filter(|p| leaves.contains(p))
            .collect();
        assert!(!queued.is_empty());
        let before = index.current_ssn();
        for page_no in &queued {
            let mut first = true;
            index
                .rtr_split_page_for_test(*page_no, |_| {
                    first = !first;
                    first
                })
                .unwrap();
            assert!(index.fetch(*page_no, LatchMode::Shared).is_some());
        }
        assert!(index.current_ssn() > before);

        while let Some(rec) = cursor.next().unwrap() {
            found.push(rec);
        }
        assert_eq!(found.len(), keys_of(&found).len());
        assert_eq!(keys_of(&found), expected);
    }

    #[test]
    fn discard_repairs_a_running_search() {
        let index = rtree(4);
        let entries = spatial_entries(120, 3);
        for (mbr, key) in &entries {
            index.rtr_insert(*mbr, key.clone(), vec![]).unwrap();
        }
        let everything = Mbr::new(-1.0, -1.0, 101.0, 101.0);

        let mut cursor = index.rtr_open(everything, SearchMode::Intersect).unwrap();
        let first = cursor.next().unwrap().unwrap();
        assert!(cursor.n_matched() > 0);

        // Find the leaf the remaining matches were copied from and empty it.
        let leaf = index
            .pages_at_level(0)
            .unwrap()
            .into_iter()
            .find(|page_no| {
                let guard = index.fetch(*page_no, LatchMode::Shared).unwrap();
                guard.records().iter().any(|rec| rec.key == first.key)
            })
            .unwrap();
        let doomed: Vec<Record> = index
            .fetch(leaf, LatchMode::Shared)
            .unwrap()
            .records()
            .to_vec();
        for rec in &doomed {
            assert!(index.rtr_delete(rec.mbr.unwrap(), &rec.key).unwrap());
        }
        assert!(index.fetch(leaf, LatchMode::Shared).is_none());
        assert_eq!(cursor.n_matched(), 0);
        assert!(!cursor.queued_pages().contains(&leaf));

        let rest = cursor.collect_all().unwrap();
        let remaining: BTreeSet<_> = entries
            .iter()
            .map(|(_, key)| key.clone())
            .filter(|key| !doomed.iter().any(|rec| rec.key == *key))
            .collect();
        // Only matches copied from the discarded page were lost.
        assert_eq!(rest.len(), remaining.len());
        assert_eq!(keys_of(&rest), remaining);
        index.validate().unwrap();
    }

    #[test]
    fn father_found_after_parent_split() {
        let index = rtree(4);
        let entries = spatial_entries(200, 5);
        for (mbr, key) in &entries {
            index.rtr_insert(*mbr, key.clone(), vec![]).unwrap();
        }
        assert!(index.height().unwrap() >= 3);

        let (mbr, key) = entries[42].clone();
        let search = RtrCursor::open(
            &index,
            SpatialKey::entry(mbr, key),
            SearchMode::Locate,
            0,
            true,
            LatchMode::Shared,
        )
        .unwrap();
        let leaf = {
            let mut mtr = Mtr::new();
            let cur = search.getnext_from_path(&mut mtr).unwrap().unwrap();
            mtr.page(cur.sp).page_no()
        };
        let parent = search
            .info
            .shared
            .paths
            .lock()
            .parent_path
            .iter()
            .rev()
            .find(|visit| visit.child_no == Some(leaf))
            .map(|visit| visit.page_no)
            .unwrap();

        // Move the pointer to the leaf into a new right sibling of its parent.
        let new_parent = index
            .rtr_split_page_for_test(parent, |rec| rec.child == Some(leaf))
            .unwrap()
            .unwrap();

        let mut mtr = Mtr::new();
        mtr.x_lock_tree(index.lock());
        let cur = index
            .rtr_page_get_father(leaf, 0, mbr, Some(&search), &mut mtr)
            .unwrap();
        let page = mtr.page(cur.sp);
        assert_eq!(page.page_no(), new_parent);
        assert_eq!(page.rec(cur.slot).unwrap().child, Some(leaf));
        mtr.commit();

        // Without a parent path the pointer is searched from the root.
        mtr.start();
        mtr.x_lock_tree(index.lock());
        let cur = index
            .rtr_page_get_father(leaf, 0, mbr, None, &mut mtr)
            .unwrap();
        assert_eq!(mtr.page(cur.sp).rec(cur.slot).unwrap().child, Some(leaf));
    }

    #[test]
    fn locate_finds_exact_entry() {
        let index = rtree(5);
        let entries = spatial_entries(100, 9);
        for (mbr, key) in &entries {
            index.rtr_insert(*mbr, key.clone(), vec![]).unwrap();
        }
        for (mbr, key) in entries.iter().step_by(7) {
            let search = RtrCursor::open(
                &index,
                SpatialKey::entry(*mbr, key.clone()),
                SearchMode::Locate,
                0,
                false,
                LatchMode::Shared,
            )
            .unwrap();
            let mut mtr = Mtr::new();
            let cur = search.getnext_from_path(&mut mtr).unwrap().unwrap();
            assert_eq!(&mtr.page(cur.sp).rec(cur.slot).unwrap().key, key);
        }
        let missing = RtrCursor::open(
            &index,
            SpatialKey::entry(entries[0].0, Tuple::from_ints(&[-1])),
            SearchMode::Locate,
            0,
            false,
            LatchMode::Shared,
        )
        .unwrap();
        let mut mtr = Mtr::new();
        assert!(missing.getnext_from_path(&mut mtr).unwrap().is_none());
    }
}
