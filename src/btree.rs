//! Page-latched index trees.
//!
//! An [`Index`] is a tree of pages living in a shared [`BufferPool`]. Leaves are at level 0 and
//! every level is a doubly linked list of pages in key order. The root page number never
//! changes: when the root overflows its content moves to a new child and the root grows a level.
//!
//! Latching rules, which together keep the tree free of latch deadlocks:
//! - the tree lock is taken before any page latch;
//! - descents hold the tree lock in shared mode and couple page latches top-down;
//! - pages of one level are latched left to right;
//! - structure modifications (splits, page discards, root changes) only happen under the
//!   exclusive tree lock, and no page other than the one being descended into stays latched
//!   while waiting for a latch further left.
//!
//! Every split stamps the page that keeps the left half with a fresh *split sequence number*
//! (SSN) and hands its previous SSN to the new right half. A search that remembered a page
//! together with the SSN current at that time can therefore tell that the page was split since,
//! and follow the right-sibling link to find what moved away.

use log::{debug, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{BufferPool, LatchMode, PageGuard};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::latch::TreeLock;
use crate::mtr::{Mtr, Savepoint};
use crate::page::{Page, PageCurMode, PageId, PageNo, Record, Slot, Tuple};
use crate::rtree::{RtrShared, RtrTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Records ordered by key.
    Clustered,
    /// Records grouped by bounding rectangle.
    Spatial,
}

/// A cursor on a page latched in a mini-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub sp: Savepoint,
    pub slot: Slot,
}

pub struct Index {
    name: String,
    kind: IndexKind,
    space: u32,
    root: PageNo,
    config: IndexConfig,
    pool: Arc<BufferPool>,
    lock: TreeLock,
    ssn: AtomicU64,
    pub(crate) rtr_track: RtrTrack,
}

impl Index {
    /// Creates an empty index whose root is a fresh leaf in `space`.
    pub fn create(
        pool: Arc<BufferPool>,
        kind: IndexKind,
        space: u32,
        name: impl Into<String>,
        config: IndexConfig,
    ) -> Result<Index> {
        let name = name.into();
        let root = pool.allocate(space, 0)?.page_no();
        debug!("created {:?} index {} with root page {}:{}", kind, name, space, root);

        Ok(Index {
            name,
            kind,
            space,
            root,
            config,
            pool,
            lock: TreeLock::new(),
            ssn: AtomicU64::new(0),
            rtr_track: RtrTrack::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn is_spatial(&self) -> bool {
        self.kind == IndexKind::Spatial
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    pub fn root(&self) -> PageNo {
        self.root
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Key fields stored by cursors to identify a record.
    pub fn n_unique(&self) -> usize {
        self.config.n_unique
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn lock(&self) -> &TreeLock {
        &self.lock
    }

    /// The split sequence number most recently handed out.
    pub fn current_ssn(&self) -> u64 {
        self.ssn.load(Ordering::SeqCst)
    }

    pub(crate) fn next_ssn(&self) -> u64 {
        self.ssn.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn page_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.space, page_no)
    }

    pub fn fetch(&self, page_no: PageNo, mode: LatchMode) -> Option<PageGuard<'_>> {
        self.pool.fetch(self.page_id(page_no), mode)
    }

    pub(crate) fn fetch_required(&self, page_no: PageNo, mode: LatchMode) -> Result<PageGuard<'_>> {
        self.fetch(page_no, mode)
            .ok_or_else(|| Error::PageNotFound(self.page_id(page_no)))
    }

    pub(crate) fn corrupt(&self, page: &Page, what: &str) -> Error {
        Error::Corruption(format!("{} in page {} of index {}", what, page.id(), self.name))
    }

    /// Number of levels, leaves included.
    pub fn height(&self) -> Result<usize> {
        let _tree = self.lock.shared();
        let root = self.fetch_required(self.root, LatchMode::Shared)?;
        Ok(root.level() + 1)
    }

    /// The child a descent towards `tuple` continues into.
    ///
    /// Searches for `Ge` or `L` positions follow the last node pointer strictly below the tuple,
    /// all others the last one not above it. A tuple sorting before every node pointer, or no
    /// tuple at all, goes to the first child.
    pub(crate) fn node_ptr_child(
        &self,
        page: &Page,
        tuple: Option<&Tuple>,
        mode: PageCurMode,
    ) -> Result<PageNo> {
        let slot = match tuple {
            Some(tuple) => {
                let non_leaf_mode = match mode {
                    PageCurMode::Ge | PageCurMode::L => PageCurMode::L,
                    PageCurMode::Le | PageCurMode::G => PageCurMode::Le,
                };
                page.search(tuple, non_leaf_mode)
            }
            None => Slot::Infimum,
        };
        let slot = if slot == Slot::Infimum {
            page.first_slot()
        } else {
            slot
        };
        page.rec(slot)
            .and_then(|rec| rec.child)
            .ok_or_else(|| self.corrupt(page, "non-leaf page without node pointer"))
    }

    /// Couples shared latches from the root down to `level` and returns that page latched in
    /// `latch` mode. `child_of` picks the child to follow on each non-leaf page.
    fn descend(
        &self,
        level: usize,
        latch: LatchMode,
        mut child_of: impl FnMut(&Page) -> Result<PageNo>,
    ) -> Result<PageGuard<'_>> {
        let _tree = self.lock.shared();

        let mut guard = self.fetch_required(self.root, LatchMode::Shared)?;
        if guard.level() < level {
            return Err(Error::Corruption(format!(
                "level {} is above the root of index {}",
                level, self.name
            )));
        }
        if guard.level() == level && latch == LatchMode::Exclusive {
            // The root level only changes under the exclusive tree lock.
            drop(guard);
            guard = self.fetch_required(self.root, latch)?;
        }

        loop {
            if guard.level() == level {
                return Ok(guard);
            }
            let child = child_of(&guard)?;
            let child_latch = if guard.level() == level + 1 {
                latch
            } else {
                LatchMode::Shared
            };
            // Latch coupling: the parent is released once the child is latched.
            guard = self.fetch_required(child, child_latch)?;
        }
    }

    /// Positions a cursor on `level` by searching `tuple` with `mode`.
    pub fn search_to_level<'a>(
        &'a self,
        tuple: &Tuple,
        level: usize,
        mode: PageCurMode,
        latch: LatchMode,
        mtr: &mut Mtr<'a>,
    ) -> Result<PageCursor> {
        let guard = self.descend(level, latch, |page| {
            self.node_ptr_child(page, Some(tuple), mode)
        })?;
        let slot = guard.search(tuple, mode);
        let sp = mtr.push(guard);
        Ok(PageCursor { sp, slot })
    }

    /// Positions a cursor before the first (`left`) or after the last record of `level`.
    pub fn open_at_side<'a>(
        &'a self,
        left: bool,
        level: usize,
        latch: LatchMode,
        mtr: &mut Mtr<'a>,
    ) -> Result<PageCursor> {
        let guard = self.descend(level, latch, |page| {
            let slot = if left { page.first_slot() } else { page.last_slot() };
            page.rec(slot)
                .and_then(|rec| rec.child)
                .ok_or_else(|| self.corrupt(page, "non-leaf page without node pointer"))
        })?;
        let slot = if left { Slot::Infimum } else { Slot::Supremum };
        let sp = mtr.push(guard);
        Ok(PageCursor { sp, slot })
    }

    /// Exclusively latches every page from the root to the leaf covering `tuple`. Returns the
    /// savepoints root first. The caller holds the exclusive tree lock.
    fn latch_path<'a>(&'a self, tuple: &Tuple, mtr: &mut Mtr<'a>) -> Result<Vec<Savepoint>> {
        debug_assert!(mtr.has_tree_x_lock());
        let mut path = vec![mtr.push(self.fetch_required(self.root, LatchMode::Exclusive)?)];
        loop {
            let page = mtr.page(path[path.len() - 1]);
            if page.is_leaf() {
                return Ok(path);
            }
            let child = self.node_ptr_child(page, Some(tuple), PageCurMode::Le)?;
            let guard = self.fetch_required(child, LatchMode::Exclusive)?;
            path.push(mtr.push(guard));
        }
    }

    /// The node pointer describing `page` in its parent.
    pub(crate) fn node_ptr_for(&self, page: &Page) -> Record {
        match self.kind {
            IndexKind::Clustered => Record::node_ptr(
                page.records()
                    .first()
                    .map(|rec| rec.key.clone())
                    .unwrap_or_default(),
                page.page_no(),
            ),
            IndexKind::Spatial => {
                Record::spatial_node_ptr(page.union_mbr().unwrap_or_default(), page.page_no())
            }
        }
    }

    /// Moves the whole root content into a new child and makes the root its only parent.
    /// Returns the savepoint of the new child, latched exclusively.
    pub(crate) fn raise_root<'a>(&'a self, mtr: &mut Mtr<'a>, root_sp: Savepoint) -> Result<Savepoint> {
        let level = mtr.page(root_sp).level();
        let mut child = self.pool.allocate(self.space, level)?;
        {
            let root = mtr.page_mut(root_sp).page_mut();
            let page = child.page_mut();
            page.records = std::mem::take(&mut root.records);
            page.ssn = root.ssn;
            root.level = level + 1;
        }
        let ptr = self.node_ptr_for(&child);
        mtr.page_mut(root_sp).page_mut().records.push(ptr);
        debug!(
            "index {}: root raised to level {}, old content moved to page {}",
            self.name,
            level + 1,
            child.page_no()
        );
        Ok(mtr.push(child))
    }

    /// Splits the page at `sp`: `take_right` removes the records that move to a new right
    /// sibling, whose node pointer is inserted in the parent at `parent_sp` next to the one of
    /// the split page. Returns the savepoint of the new page.
    pub(crate) fn split_page<'a>(
        &'a self,
        mtr: &mut Mtr<'a>,
        sp: Savepoint,
        parent_sp: Savepoint,
        take_right: impl FnOnce(&mut Page) -> Vec<Record>,
    ) -> Result<Savepoint> {
        let (level, left_no, next) = {
            let page = mtr.page(sp);
            (page.level(), page.page_no(), page.next())
        };
        let mut right = self.pool.allocate(self.space, level)?;
        let right_no = right.page_no();

        if let Some(next_no) = next {
            let mut next_guard = self.fetch_required(next_no, LatchMode::Exclusive)?;
            next_guard.page_mut().prev = Some(right_no);
        }

        let ssn = self.next_ssn();
        {
            let left = mtr.page_mut(sp).page_mut();
            let page = right.page_mut();
            page.records = take_right(left);
            page.prev = Some(left_no);
            page.next = next;
            // Searches that queued the left page before this split must reach the right half.
            page.ssn = left.ssn;
            left.ssn = ssn;
            left.next = Some(right_no);
        }

        let left_ptr = self.node_ptr_for(mtr.page(sp));
        let right_ptr = self.node_ptr_for(&right);
        {
            let parent = mtr.page_mut(parent_sp).page_mut();
            let pos = parent
                .child_position(left_no)
                .ok_or_else(|| self.corrupt(parent, "missing node pointer"))?;
            if self.is_spatial() {
                parent.records[pos].mbr = left_ptr.mbr;
            } else if pos == 0 {
                // The first pointer routes every key below the page's pointers, so its key may
                // be above the right half's.
                parent.records[0].key = left_ptr.key;
            }
            parent.insert_at(pos + 1, right_ptr);
        }

        trace!(
            "index {}: split page {} at level {}, new right page {}, ssn {}",
            self.name, left_no, level, right_no, ssn
        );
        Ok(mtr.push(right))
    }

    /// Splits overflowing pages bottom-up along `path` (root first).
    ///
    /// Clustered pages are cut in the middle of their key order. Spatial pages are first sorted
    /// by the centre of their rectangles along the wider axis of the page, so each half stays
    /// compact.
    pub(crate) fn split_overflowing<'a>(&'a self, mtr: &mut Mtr<'a>, path: &[Savepoint]) -> Result<()> {
        let capacity = self.config.page_capacity;
        let mut path = path.to_vec();
        let mut depth = path.len() - 1;
        loop {
            if mtr.page(path[depth]).n_recs() <= capacity {
                return Ok(());
            }
            if depth == 0 {
                let child_sp = self.raise_root(mtr, path[0])?;
                path.insert(1, child_sp);
                depth = 1;
            }
            let kind = self.kind;
            self.split_page(mtr, path[depth], path[depth - 1], |page| {
                if kind == IndexKind::Spatial {
                    sort_by_center(page);
                }
                let mid = page.records.len() / 2;
                page.records.split_off(mid)
            })?;
            depth -= 1;
        }
    }

    /// Inserts a user record. Fails with [`Error::DuplicateKey`] if the key is present.
    pub fn insert(&self, rec: Record) -> Result<()> {
        debug_assert!(!self.is_spatial());
        {
            let mut guard = self.descend(0, LatchMode::Exclusive, |page| {
                self.node_ptr_child(page, Some(&rec.key), PageCurMode::Le)
            })?;
            match guard.insert_position(&rec.key) {
                Ok(_) => return Err(Error::DuplicateKey),
                Err(pos) if guard.n_recs() < self.config.page_capacity => {
                    guard.page_mut().insert_at(pos, rec);
                    return Ok(());
                }
                Err(_) => {}
            }
        }
        self.insert_pessimistic(rec)
    }

    fn insert_pessimistic(&self, rec: Record) -> Result<()> {
        let mut mtr = Mtr::new();
        mtr.x_lock_tree(&self.lock);
        let path = self.latch_path(&rec.key, &mut mtr)?;
        let leaf_sp = path[path.len() - 1];

        let page = mtr.page_mut(leaf_sp).page_mut();
        let pos = match page.insert_position(&rec.key) {
            Ok(_) => return Err(Error::DuplicateKey),
            Err(pos) => pos,
        };
        page.insert_at(pos, rec);

        self.split_overflowing(&mut mtr, &path)?;
        mtr.commit();
        Ok(())
    }

    /// Removes the record with `key`. Returns whether it existed.
    ///
    /// A non-root page left empty is discarded, so no page but the root is ever empty.
    pub fn delete(&self, key: &Tuple) -> Result<bool> {
        debug_assert!(!self.is_spatial());
        {
            let mut guard = self.descend(0, LatchMode::Exclusive, |page| {
                self.node_ptr_child(page, Some(key), PageCurMode::Le)
            })?;
            let pos = match guard.insert_position(key) {
                Ok(pos) => pos,
                Err(_) => return Ok(false),
            };
            if guard.n_recs() > 1 || guard.page_no() == self.root {
                guard.page_mut().remove(pos);
                return Ok(true);
            }
        }
        self.delete_pessimistic(key)
    }

    fn delete_pessimistic(&self, key: &Tuple) -> Result<bool> {
        let mut mtr = Mtr::new();
        mtr.x_lock_tree(&self.lock);
        let path = self.latch_path(key, &mut mtr)?;
        let leaf_sp = path[path.len() - 1];

        let page = mtr.page_mut(leaf_sp).page_mut();
        match page.insert_position(key) {
            Ok(pos) => {
                page.remove(pos);
            }
            Err(_) => return Ok(false),
        }

        let mut depth = path.len() - 1;
        while depth > 0 && mtr.page(path[depth]).is_empty() {
            let page_no = mtr.page(path[depth]).page_no();
            // Siblings are latched left to right, so the page itself must not be held.
            mtr.release_at_savepoint(path[depth]);
            self.free_page(page_no, None)?;

            let parent = mtr.page_mut(path[depth - 1]).page_mut();
            let pos = parent
                .child_position(page_no)
                .ok_or_else(|| self.corrupt(parent, "missing node pointer"))?;
            parent.remove(pos);
            depth -= 1;
        }
        if depth == 0 {
            self.collapse_empty_root(mtr.page_mut(path[0]).page_mut());
        }
        mtr.commit();
        Ok(true)
    }

    /// A root that lost its last child becomes an empty leaf again.
    pub(crate) fn collapse_empty_root(&self, root: &mut Page) {
        if root.is_empty() && root.level > 0 {
            debug!("index {}: root emptied at level {}, now a leaf", self.name, root.level);
            root.level = 0;
        }
    }

    /// Unlinks an empty page from its level and returns its frame to the pool.
    ///
    /// Runs under the exclusive tree lock with neither the page nor its siblings latched by the
    /// caller. Spatial searches other than `skip` forget the page.
    pub(crate) fn free_page(&self, page_no: PageNo, skip: Option<&Arc<RtrShared>>) -> Result<()> {
        let (prev, next) = {
            let guard = self.fetch_required(page_no, LatchMode::Shared)?;
            (guard.prev(), guard.next())
        };
        let mut prev_guard = prev
            .map(|p| self.fetch_required(p, LatchMode::Exclusive))
            .transpose()?;
        let guard = self.fetch_required(page_no, LatchMode::Exclusive)?;
        let mut next_guard = next
            .map(|p| self.fetch_required(p, LatchMode::Exclusive))
            .transpose()?;

        if let Some(g) = prev_guard.as_mut() {
            g.page_mut().next = next;
        }
        if let Some(g) = next_guard.as_mut() {
            g.page_mut().prev = prev;
        }
        drop(next_guard);
        drop(prev_guard);

        if self.is_spatial() {
            self.rtr_track.check_discard_page(skip, page_no);
        }
        trace!("index {}: discarded page {} at level {}", self.name, page_no, guard.level());
        self.pool.free(guard);
        Ok(())
    }

    /// Sets or clears the delete mark of the record with `key`. Delete-marked records stay in
    /// the tree but are skipped by scans.
    pub fn delete_mark(&self, key: &Tuple, deleted: bool) -> Result<bool> {
        let mut guard = self.descend(0, LatchMode::Exclusive, |page| {
            self.node_ptr_child(page, Some(key), PageCurMode::Le)
        })?;
        match guard.insert_position(key) {
            Ok(pos) => {
                guard.page_mut().records[pos].deleted = deleted;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn lookup(&self, key: &Tuple) -> Result<Option<Record>> {
        let guard = self.descend(0, LatchMode::Shared, |page| {
            self.node_ptr_child(page, Some(key), PageCurMode::Le)
        })?;
        Ok(guard
            .insert_position(key)
            .ok()
            .map(|pos| guard.records()[pos].clone()))
    }

    /// The first page of `level` in sibling order.
    ///
    /// Spatial pages keep their node pointers sorted by rectangle, so the first pointer need not
    /// lead to the head of the level: the descent ends with a walk to the left.
    fn first_page_at_level(&self, level: usize) -> Result<PageGuard<'_>> {
        let _tree = self.lock.shared();
        let mut guard = self.descend(level, LatchMode::Shared, |page| {
            page.records()
                .first()
                .and_then(|rec| rec.child)
                .ok_or_else(|| self.corrupt(page, "non-leaf page without node pointer"))
        })?;
        while let Some(prev) = guard.prev() {
            // Pages of a level are latched left to right only.
            drop(guard);
            guard = self.fetch_required(prev, LatchMode::Shared)?;
        }
        Ok(guard)
    }

    /// Page numbers of `level`, left to right.
    pub fn pages_at_level(&self, level: usize) -> Result<Vec<PageNo>> {
        let mut guard = self.first_page_at_level(level)?;
        let mut pages = vec![guard.page_no()];
        while let Some(next) = guard.next() {
            guard = self.fetch_required(next, LatchMode::Shared)?;
            pages.push(next);
        }
        Ok(pages)
    }

    /// Every record of the leaf level in order, delete-marked ones included.
    pub fn scan_all(&self) -> Result<Vec<Record>> {
        let mut guard = self.first_page_at_level(0)?;
        let mut records = guard.records().to_vec();
        while let Some(next) = guard.next() {
            guard = self.fetch_required(next, LatchMode::Shared)?;
            records.extend_from_slice(guard.records());
        }
        Ok(records)
    }

    /// Builds the tree bottom-up from `records`, filling every page. The index must be empty.
    pub fn bulk_load(&self, mut records: Vec<Record>) -> Result<()> {
        let mut mtr = Mtr::new();
        mtr.x_lock_tree(&self.lock);
        let root_sp = mtr.push(self.fetch_required(self.root, LatchMode::Exclusive)?);
        if !mtr.page(root_sp).is_empty() {
            return Err(Error::NotEmpty(self.name.clone()));
        }

        if !self.is_spatial() {
            records.sort_by(|a, b| a.key.cmp(&b.key));
            if records.windows(2).any(|w| w[0].key == w[1].key) {
                return Err(Error::DuplicateKey);
            }
        }

        let capacity = self.config.page_capacity.max(2);
        let mut level = 0;
        let mut current = records;
        while current.len() > capacity {
            let mut pages = Vec::new();
            while !current.is_empty() {
                let rest = if current.len() > capacity {
                    current.split_off(capacity)
                } else {
                    Vec::new()
                };
                let mut guard = self.pool.allocate(self.space, level)?;
                guard.page_mut().records = std::mem::replace(&mut current, rest);
                pages.push(guard);
            }

            let page_nos: Vec<PageNo> = pages.iter().map(|g| g.page_no()).collect();
            for (i, guard) in pages.iter_mut().enumerate() {
                let page = guard.page_mut();
                page.prev = if i > 0 { Some(page_nos[i - 1]) } else { None };
                page.next = page_nos.get(i + 1).copied();
            }
            current = pages.iter().map(|g| self.node_ptr_for(g)).collect();
            level += 1;
        }

        let root = mtr.page_mut(root_sp).page_mut();
        root.level = level;
        root.records = current;
        debug!("index {}: bulk loaded, root at level {}", self.name, level);
        mtr.commit();
        Ok(())
    }

    /// Checks the structural invariants of every level.
    pub fn validate(&self) -> Result<()> {
        let _tree = self.lock.shared();
        let height = {
            let root = self.fetch_required(self.root, LatchMode::Shared)?;
            root.level() + 1
        };

        for level in 0..height {
            let pages = self.pages_at_level(level)?;
            let mut prev: Option<PageNo> = None;
            let mut last_key: Option<Tuple> = None;
            for page_no in pages.iter() {
                let guard = self.fetch_required(*page_no, LatchMode::Shared)?;
                if guard.level() != level {
                    return Err(self.corrupt(&guard, "page on the wrong level"));
                }
                if guard.prev() != prev {
                    return Err(self.corrupt(&guard, "broken left sibling link"));
                }
                if guard.is_empty() && *page_no != self.root {
                    return Err(self.corrupt(&guard, "empty non-root page"));
                }
                if !self.is_spatial() {
                    for rec in guard.records() {
                        if let Some(last) = &last_key {
                            if *last >= rec.key {
                                return Err(self.corrupt(&guard, "keys out of order"));
                            }
                        }
                        last_key = Some(rec.key.clone());
                    }
                }
                if level > 0 {
                    for (i, rec) in guard.records().iter().enumerate() {
                        let child_no = rec
                            .child
                            .ok_or_else(|| self.corrupt(&guard, "node pointer without child"))?;
                        let child = self.fetch_required(child_no, LatchMode::Shared)?;
                        if child.level() + 1 != level {
                            return Err(self.corrupt(&child, "child on the wrong level"));
                        }
                        let covered = match self.kind {
                            // The first pointer of a page is the page's minimum record.
                            IndexKind::Clustered if i == 0 => !child.is_empty(),
                            IndexKind::Clustered => child
                                .records()
                                .first()
                                .map_or(false, |first| rec.key <= first.key),
                            IndexKind::Spatial => match (rec.mbr, child.union_mbr()) {
                                (Some(outer), Some(inner)) => outer.contains(&inner),
                                _ => false,
                            },
                        };
                        if !covered {
                            return Err(self.corrupt(&guard, "node pointer does not cover child"));
                        }
                    }
                }
                prev = Some(*page_no);
            }
        }
        Ok(())
    }
}

fn sort_by_center(page: &mut Page) {
    let bounds = match page.union_mbr() {
        Some(bounds) => bounds,
        None => return,
    };
    let along_x = bounds.xmax - bounds.xmin >= bounds.ymax - bounds.ymin;
    let center = |rec: &Record| {
        let (x, y) = rec.mbr.unwrap_or_default().center();
        if along_x {
            x
        } else {
            y
        }
    };
    page.records
        .sort_by(|a, b| center(a).partial_cmp(&center(b)).unwrap_or(std::cmp::Ordering::Equal));
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("space", &self.space)
            .field("root", &self.root)
            .field("ssn", &self.current_ssn())
            .finish()
    }
}
