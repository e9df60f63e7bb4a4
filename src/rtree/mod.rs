//! Spatial index search and maintenance.
//!
//! Entries of a spatial index are bounding rectangles. Rectangles of sibling subtrees may
//! overlap, so a search cannot follow a single path: matching node pointers are queued on a
//! per-search path stack and explored one after the other. Each queued entry carries the split
//! sequence number current when it was queued. A page found to have a newer number was split in
//! between, and its right sibling is queued as well.
//!
//! Every open search is registered with its index. Before a page is discarded, the registry is
//! used to remove that page from every other search's path and to drop matches copied from it.

mod insert;
mod mbr;
mod search;

use log::trace;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::btree::Index;
use crate::page::{PageNo, PageSnapshot};
use crate::pcur::PersistentCursor;

pub use mbr::{Mbr, SearchMode, Strategy};
pub use search::{RtrCursor, SpatialKey};

/// A page queued for a visit, or, on the parent path, a node pointer that was followed.
#[derive(Debug, Clone)]
pub(crate) struct NodeVisit {
    pub page_no: PageNo,
    /// Index split sequence number when the entry was queued.
    pub seq_no: u64,
    pub level: usize,
    pub child_no: Option<PageNo>,
    /// Position of the node pointer, kept on the parent path only.
    pub cursor: Option<PersistentCursor>,
    /// Area the node pointer's rectangle grew by to take an inserted entry.
    pub mbr_inc: f64,
}

impl NodeVisit {
    pub fn page(page_no: PageNo, seq_no: u64, level: usize) -> NodeVisit {
        NodeVisit {
            page_no,
            seq_no,
            level,
            child_no: None,
            cursor: None,
            mbr_inc: 0.0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SearchPaths {
    pub path: Vec<NodeVisit>,
    pub parent_path: Vec<NodeVisit>,
}

/// Leaf matches copied out of the page they were found in.
#[derive(Debug, Default)]
pub(crate) struct MatchedRecs {
    pub snapshot: Option<PageSnapshot>,
    pub valid: bool,
}

impl MatchedRecs {
    pub fn pop(&mut self) -> Option<crate::page::Record> {
        if !self.valid {
            return None;
        }
        let snapshot = self.snapshot.as_mut()?;
        let rec = snapshot.records.pop();
        if snapshot.records.is_empty() {
            self.clear();
        }
        rec
    }

    pub fn len(&self) -> usize {
        match (&self.snapshot, self.valid) {
            (Some(snapshot), true) => snapshot.records.len(),
            _ => 0,
        }
    }

    pub fn clear(&mut self) {
        self.snapshot = None;
        self.valid = false;
    }
}

/// State of one search that other threads may need to repair.
#[derive(Debug, Default)]
pub(crate) struct RtrShared {
    pub paths: Mutex<SearchPaths>,
    pub matches: Mutex<MatchedRecs>,
}

/// The active searches of one index.
#[derive(Debug, Default)]
pub(crate) struct RtrTrack {
    active: Mutex<Vec<Weak<RtrShared>>>,
}

impl RtrTrack {
    pub fn register(&self, shared: &Arc<RtrShared>) {
        self.active.lock().push(Arc::downgrade(shared));
    }

    pub fn deregister(&self, shared: &Arc<RtrShared>) {
        let target = Arc::as_ptr(shared);
        self.active
            .lock()
            .retain(|weak| weak.as_ptr() != target && weak.strong_count() > 0);
    }

    pub fn n_active(&self) -> usize {
        self.active
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Removes every reference to `page_no` from the searches other than `skip`.
    pub fn check_discard_page(&self, skip: Option<&Arc<RtrShared>>, page_no: PageNo) {
        let active = self.active.lock();
        for weak in active.iter() {
            let shared = match weak.upgrade() {
                Some(shared) => shared,
                None => continue,
            };
            if skip.map_or(false, |skip| Arc::ptr_eq(skip, &shared)) {
                continue;
            }

            {
                let mut paths = shared.paths.lock();
                paths.path.retain(|visit| visit.page_no != page_no);
                paths
                    .parent_path
                    .retain(|visit| visit.child_no != Some(page_no));
            }

            let mut matches = shared.matches.lock();
            let from_page = matches
                .snapshot
                .as_ref()
                .map_or(false, |snapshot| snapshot.id.page_no == page_no);
            if from_page {
                trace!("dropping matches copied from discarded page {}", page_no);
                matches.clear();
            }
        }
    }
}

/// Registration of one search with its index, undone on drop.
pub(crate) struct RtrInfo<'a> {
    index: &'a Index,
    pub shared: Arc<RtrShared>,
    pub need_parent: bool,
}

impl<'a> RtrInfo<'a> {
    pub fn new(index: &'a Index, need_parent: bool) -> RtrInfo<'a> {
        let shared = Arc::new(RtrShared::default());
        index.rtr_track.register(&shared);
        RtrInfo {
            index,
            shared,
            need_parent,
        }
    }

    pub fn index(&self) -> &'a Index {
        self.index
    }
}

impl<'a> Drop for RtrInfo<'a> {
    fn drop(&mut self) {
        self.index.rtr_track.deregister(&self.shared);
    }
}
