//! Mini-transactions: the set of latches a thread holds while it works on an index.
//!
//! Every page latched through an [`Mtr`] is remembered in its memo under a [`Savepoint`]. Cursors
//! refer to pages by savepoint, never by reference, so the memo is the single owner of every
//! guard and committing the mini-transaction releases everything at once.

use crate::buffer::PageGuard;
use crate::latch::{TreeExclusiveGuard, TreeLock, TreeSharedGuard};

/// Index of a page latch inside a mini-transaction memo.
pub type Savepoint = usize;

enum TreeLatch<'p> {
    Shared(TreeSharedGuard<'p>),
    Exclusive(TreeExclusiveGuard<'p>),
}

pub struct Mtr<'p> {
    memo: Vec<Option<PageGuard<'p>>>,
    tree: Option<TreeLatch<'p>>,
    active: bool,
}

impl<'p> Default for Mtr<'p> {
    fn default() -> Self {
        Mtr::new()
    }
}

impl<'p> Mtr<'p> {
    /// Creates a started mini-transaction.
    pub fn new() -> Mtr<'p> {
        Mtr {
            memo: Vec::new(),
            tree: None,
            active: true,
        }
    }

    pub fn start(&mut self) {
        debug_assert!(!self.active, "mini-transaction already started");
        self.active = true;
    }

    /// Releases every latch held and ends the mini-transaction.
    pub fn commit(&mut self) {
        while let Some(guard) = self.memo.pop() {
            drop(guard);
        }
        self.tree = None;
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The savepoint the next pushed latch will get.
    pub fn savepoint(&self) -> Savepoint {
        self.memo.len()
    }

    pub fn push(&mut self, guard: PageGuard<'p>) -> Savepoint {
        debug_assert!(self.active);
        self.memo.push(Some(guard));
        self.memo.len() - 1
    }

    /// The page latched at `sp`.
    ///
    /// Panics if that latch was already released: cursors never outlive their latch.
    pub fn page(&self, sp: Savepoint) -> &PageGuard<'p> {
        match self.memo.get(sp) {
            Some(Some(guard)) => guard,
            _ => panic!("no latch at savepoint {}", sp),
        }
    }

    pub fn page_mut(&mut self, sp: Savepoint) -> &mut PageGuard<'p> {
        match self.memo.get_mut(sp) {
            Some(Some(guard)) => guard,
            _ => panic!("no latch at savepoint {}", sp),
        }
    }

    pub fn is_latched(&self, sp: Savepoint) -> bool {
        matches!(self.memo.get(sp), Some(Some(_)))
    }

    /// Takes the guard out of the memo, e.g. to hand it back to the buffer pool.
    pub fn take(&mut self, sp: Savepoint) -> Option<PageGuard<'p>> {
        let guard = self.memo.get_mut(sp).and_then(Option::take);
        self.trim();
        guard
    }

    /// Releases the single latch at `sp`. Later savepoints stay valid.
    pub fn release_at_savepoint(&mut self, sp: Savepoint) {
        if let Some(slot) = self.memo.get_mut(sp) {
            *slot = None;
        }
        self.trim();
    }

    /// Releases every page latch acquired at or after `sp`.
    pub fn release_from(&mut self, sp: Savepoint) {
        while self.memo.len() > sp {
            self.memo.pop();
        }
    }

    fn trim(&mut self) {
        while let Some(None) = self.memo.last() {
            self.memo.pop();
        }
    }

    /// Number of page latches currently held.
    pub fn n_latched(&self) -> usize {
        self.memo.iter().filter(|g| g.is_some()).count()
    }

    pub fn s_lock_tree(&mut self, lock: &'p TreeLock) {
        debug_assert!(self.tree.is_none());
        self.tree = Some(TreeLatch::Shared(lock.shared()));
    }

    pub fn x_lock_tree(&mut self, lock: &'p TreeLock) {
        debug_assert!(self.tree.is_none());
        self.tree = Some(TreeLatch::Exclusive(lock.exclusive()));
    }

    pub fn release_tree(&mut self) {
        self.tree = None;
    }

    pub fn has_tree_x_lock(&self) -> bool {
        matches!(self.tree, Some(TreeLatch::Exclusive(_)))
    }

    pub fn has_tree_lock(&self) -> bool {
        self.tree.is_some()
    }
}

impl<'p> std::fmt::Debug for Mtr<'p> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mtr")
            .field("latched", &self.n_latched())
            .field("tree", &self.has_tree_lock())
            .field("active", &self.active)
            .finish()
    }
}
