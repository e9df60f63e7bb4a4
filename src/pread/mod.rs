//! Parallel range scans over a clustered index.
//!
//! A scan is partitioned into contiguous key ranges by descending from the root with shared
//! latches. Each range becomes an execution context placed on a shared queue; worker threads
//! pop contexts and walk their range page by page, calling the row callback on every visible
//! record. Contexts whose range is too large for an even split are re-partitioned one level
//! deeper by the worker that picks them up.
//!
//! The number of worker threads is bounded by a budget shared by every reader of the process:
//! see [`ParallelReader::available_threads`].

mod pcursor;
mod worker;

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::btree::{Index, PageCursor};
use crate::buffer::LatchMode;
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::mtr::{Mtr, Savepoint};
use crate::page::{Page, PageCurMode, PageNo, Record, Slot, Tuple};
use crate::pcur::{PersistentCursor, RelPos};

use pcursor::PCursor;
pub use worker::{MAX_RESERVED_THREADS, MAX_THREADS, MAX_TOTAL_THREADS};
use worker::Event;

/// The transaction a scan reads on behalf of.
pub trait Trx: Sync {
    /// Polled between pages and contexts. A true answer ends the scan with
    /// [`Error::Interrupted`].
    fn is_interrupted(&self) -> bool {
        false
    }

    /// Whether a leaf record is visible to the transaction's snapshot.
    fn is_visible(&self, _rec: &Record) -> bool {
        true
    }
}

/// Key interval `[start, end)` of a scan. Missing bounds are open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRange {
    pub start: Option<Tuple>,
    pub end: Option<Tuple>,
}

#[derive(Debug, Clone)]
pub struct ScanConfig<'a> {
    pub index: &'a Index,
    pub range: ScanRange,
    /// Level the records are read from: 0 for leaves, 1 for the node pointers to them.
    pub read_level: usize,
    pub partition_id: Option<usize>,
}

impl<'a> ScanConfig<'a> {
    pub fn new(index: &'a Index) -> ScanConfig<'a> {
        ScanConfig {
            index,
            range: ScanRange::default(),
            read_level: 0,
            partition_id: None,
        }
    }

    pub fn with_range(mut self, start: Option<Tuple>, end: Option<Tuple>) -> Self {
        self.range = ScanRange { start, end };
        self
    }

    pub fn with_read_level(mut self, read_level: usize) -> Self {
        self.read_level = read_level;
        self
    }

    pub fn with_partition_id(mut self, partition_id: usize) -> Self {
        self.partition_id = Some(partition_id);
        self
    }
}

/// What a start or finish callback is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unknown,
    Thread,
    Ctx,
    Page,
}

/// Per-worker state handed to the callbacks.
pub struct ThreadCtx {
    id: usize,
    state: State,
    /// Free for the callbacks to keep whatever they need across calls.
    pub callback_ctx: Option<Box<dyn Any + Send>>,
}

impl ThreadCtx {
    pub(crate) fn new(id: usize) -> ThreadCtx {
        ThreadCtx {
            id,
            state: State::Unknown,
            callback_ctx: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The callback context downcast to `T`, if it holds one.
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.callback_ctx.as_mut()?.downcast_mut()
    }
}

impl fmt::Debug for ThreadCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCtx")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// What the row callback sees of the record being visited.
pub struct ExecCtx<'c> {
    ctx_id: usize,
    scan_id: usize,
    partition_id: Option<usize>,
    thread_ctx: &'c mut ThreadCtx,
    page: &'c Page,
    rec: &'c Record,
    first_rec_on_page: bool,
    start: bool,
}

impl<'c> ExecCtx<'c> {
    pub fn record(&self) -> &Record {
        self.rec
    }

    /// The page holding the record, latched in shared mode for the duration of the call.
    pub fn page(&self) -> &Page {
        self.page
    }

    pub fn ctx_id(&self) -> usize {
        self.ctx_id
    }

    pub fn scan_id(&self) -> usize {
        self.scan_id
    }

    pub fn partition_id(&self) -> Option<usize> {
        self.partition_id
    }

    pub fn thread_id(&self) -> usize {
        self.thread_ctx.id()
    }

    pub fn thread_ctx(&mut self) -> &mut ThreadCtx {
        self.thread_ctx
    }

    pub fn is_first_rec_on_page(&self) -> bool {
        self.first_rec_on_page
    }

    /// True until the context delivered its first record.
    pub fn is_start(&self) -> bool {
        self.start
    }
}

pub type RowFn<'a> = Box<dyn Fn(&mut ExecCtx<'_>) -> Result<()> + Send + Sync + 'a>;
pub type ThreadFn<'a> = Box<dyn Fn(&mut ThreadCtx) -> Result<()> + Send + Sync + 'a>;

/// One end of a range: the key it starts at and, for starts, the stored cursor on it.
#[derive(Debug, Default)]
pub(crate) struct Iter {
    pub tuple: Option<Tuple>,
    pub pcur: Mutex<Option<PersistentCursor>>,
}

impl Iter {
    fn end(tuple: Option<Tuple>) -> Iter {
        Iter {
            tuple,
            pcur: Mutex::new(None),
        }
    }
}

/// Start and end of a range. The end of a range is the start of the next one.
pub(crate) type Range = (Arc<Iter>, Arc<Iter>);

/// A unit of work: one range of one scan.
pub(crate) struct Ctx<'a> {
    id: usize,
    scan: Arc<ScanCtx<'a>>,
    range: Range,
    /// Re-partition the range instead of traversing it.
    split: bool,
}

impl<'a> Ctx<'a> {
    /// Re-partitions the range one level below the root and queues the pieces.
    fn split(&self, reader: &ParallelReader<'a>) -> Result<()> {
        let range = ScanRange {
            start: self.range.0.tuple.clone(),
            end: self.range.1.tuple.clone(),
        };
        let _s_lock = self.scan.index_s_lock();

        let mut ranges = Vec::new();
        self.scan.partition(&range, &mut ranges, 1)?;
        if let Some(last) = ranges.last_mut() {
            last.1 = self.range.1.clone();
        }
        debug!(
            "scan {}: context {} split into {} ranges",
            self.scan.id,
            self.id,
            ranges.len()
        );

        for range in ranges {
            if let Err(err) = self.scan.create_context(range, false, reader) {
                self.scan.set_error_state(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }

    fn traverse(&self, thread: &mut ThreadCtx, reader: &ParallelReader<'a>) -> Result<()> {
        let config = &self.scan.config;
        let pcur = self
            .range
            .0
            .pcur
            .lock()
            .take()
            .ok_or_else(|| Error::Corruption(format!("context {} without a start cursor", self.id)))?;
        let mut pcursor = PCursor::new(config.index, pcur, reader.config.level_one_retries);
        pcursor.restore_to_range_start()?;

        self.traverse_recs(&mut pcursor, thread, reader)
    }

    fn traverse_recs(
        &self,
        pcursor: &mut PCursor<'a>,
        thread: &mut ThreadCtx,
        reader: &ParallelReader<'a>,
    ) -> Result<()> {
        let scan = &self.scan;
        let end = self.range.1.tuple.as_ref();
        let probe = reader.config.interrupt_probe_pages.max(1);

        let mut n_pages = 0usize;
        let mut start = true;
        let mut first_rec = true;

        let mut result = reader.callback(&reader.start_callback, thread, State::Page);
        let mut call_end_page = true;

        while result.is_ok() {
            if pcursor.is_before_first_on_page() {
                pcursor.move_to_next_on_page();
            }
            if pcursor.is_after_last_on_page() {
                call_end_page = false;
                if let Err(err) = reader.callback(&reader.finish_callback, thread, State::Page) {
                    result = Err(err);
                    break;
                }

                if n_pages % probe == 0 && scan.is_interrupted() {
                    result = Err(Error::Interrupted);
                    break;
                }
                if scan.is_error_set() || reader.is_error_set() {
                    break;
                }

                match pcursor.move_to_next_block() {
                    Ok(()) => {}
                    Err(Error::EndOfIndex) => break,
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }

                n_pages += 1;
                first_rec = true;
                call_end_page = true;

                if let Err(err) = reader.callback(&reader.start_callback, thread, State::Page) {
                    result = Err(err);
                    break;
                }
                continue;
            }

            let page = pcursor.page();
            let slot = pcursor.slot();
            let rec = match page.rec(slot) {
                Some(rec) => rec,
                None => break,
            };

            if let Some(end) = end {
                if !is_min_rec(page, slot) && end.compare(&rec.key) != Ordering::Greater {
                    break;
                }
            }

            let skip = page.is_leaf() && !scan.check_visibility(rec);
            if !skip {
                let mut exec = ExecCtx {
                    ctx_id: self.id,
                    scan_id: scan.id,
                    partition_id: scan.config.partition_id,
                    thread_ctx: &mut *thread,
                    page,
                    rec,
                    first_rec_on_page: first_rec,
                    start,
                };
                result = (scan.f)(&mut exec);
                if result.is_err() {
                    break;
                }
                start = false;
            }

            first_rec = false;
            pcursor.move_to_next_on_page();
        }

        if let Err(err) = &result {
            scan.set_error_state(err.clone());
        }
        pcursor.commit();

        if call_end_page {
            let finished = reader.callback(&reader.finish_callback, thread, State::Page);
            if let Err(err) = finished {
                if result.is_ok() && !scan.is_error_set() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

fn skip_infimum(page: &Page, slot: Slot) -> Slot {
    if slot == Slot::Infimum {
        page.next_slot(slot)
    } else {
        slot
    }
}

/// The first node pointer of a non-leaf page stands for every key of the page's subtree below
/// the next pointer, whatever its own key. Its key is never used as a bound.
fn is_min_rec(page: &Page, slot: Slot) -> bool {
    !page.is_leaf() && slot == page.first_slot()
}

/// Releases the scan's shared tree lock when the last holder drops it.
pub(crate) struct IndexSLock<'s, 'a> {
    scan: &'s ScanCtx<'a>,
}

impl<'s, 'a> Drop for IndexSLock<'s, 'a> {
    fn drop(&mut self) {
        if self.scan.s_locks.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
            // The lock may have been taken by another worker of the same scan.
            unsafe { self.scan.config.index.lock().unlock_shared_raw() }
        }
    }
}

/// One scan added to a reader.
pub struct ScanCtx<'a> {
    id: usize,
    config: ScanConfig<'a>,
    trx: Option<&'a dyn Trx>,
    f: RowFn<'a>,
    /// Levels below the root the partitioning descended through.
    depth: AtomicUsize,
    s_locks: AtomicUsize,
    err: Mutex<Option<Error>>,
}

impl<'a> ScanCtx<'a> {
    fn new(id: usize, trx: Option<&'a dyn Trx>, config: ScanConfig<'a>, f: RowFn<'a>) -> ScanCtx<'a> {
        ScanCtx {
            id,
            config,
            trx,
            f,
            depth: AtomicUsize::new(0),
            s_locks: AtomicUsize::new(0),
            err: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &ScanConfig<'a> {
        &self.config
    }

    /// The first error a context of this scan ran into.
    pub fn error(&self) -> Option<Error> {
        self.err.lock().clone()
    }

    pub fn is_error_set(&self) -> bool {
        self.err.lock().is_some()
    }

    pub(crate) fn set_error_state(&self, err: Error) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Takes the tree lock in shared mode on behalf of the whole scan. The lock is held while
    /// any holder of the returned guard lives.
    pub(crate) fn index_s_lock(&self) -> IndexSLock<'_, 'a> {
        if self.s_locks.fetch_add(1, AtomicOrdering::AcqRel) == 0 {
            self.config.index.lock().lock_shared_raw();
        }
        IndexSLock { scan: self }
    }

    fn is_interrupted(&self) -> bool {
        self.trx.map_or(false, |trx| trx.is_interrupted())
    }

    /// Leaf records skipped by the scan: delete-marked ones and those the transaction cannot
    /// see.
    fn check_visibility(&self, rec: &Record) -> bool {
        if let Some(trx) = self.trx {
            if !trx.is_visible(rec) {
                return false;
            }
        }
        !rec.deleted
    }

    /// Splits `range` into contiguous ranges, one per subtree `split_level` levels below the
    /// root. The caller holds the scan's tree lock.
    pub(crate) fn partition(&self, range: &ScanRange, ranges: &mut Vec<Range>, split_level: usize) -> Result<()> {
        let index = self.config.index;
        let mut mtr = Mtr::new();
        self.create_ranges(range, index.root(), 0, split_level, ranges, &mut mtr)?;

        if range.end.is_some() {
            if let Some(last) = ranges.last_mut() {
                last.1 = Arc::new(Iter::end(range.end.clone()));
            }
        }
        mtr.commit();
        debug!(
            "scan {}: partitioned index {} at split level {} into {} ranges",
            self.id,
            index.name(),
            split_level,
            ranges.len()
        );
        Ok(())
    }

    /// Walks the node pointers of one page, recursing until `split_level`, and creates a
    /// range for every subtree in the scan range.
    fn create_ranges(
        &self,
        range: &ScanRange,
        page_no: PageNo,
        depth: usize,
        split_level: usize,
        ranges: &mut Vec<Range>,
        mtr: &mut Mtr<'a>,
    ) -> Result<()> {
        let index = self.config.index;
        let read_level = self.config.read_level;
        let sp = mtr.push(index.fetch_required(page_no, LatchMode::Shared)?);

        let (at_level, mut slot) = {
            let page = mtr.page(sp);
            debug_assert!(read_level <= page.level());
            let slot = match &range.start {
                Some(start) => skip_infimum(page, page.search(start, PageCurMode::Le)),
                None => page.first_slot(),
            };
            (page.level(), slot)
        };
        let mut start = range.start.clone();
        let mut savepoints = Vec::new();

        while slot.is_user_rec() {
            let (child, past_end) = {
                let page = mtr.page(sp);
                let rec = page
                    .rec(slot)
                    .ok_or_else(|| index.corrupt(page, "slot past the last record"))?;
                let past_end = match &range.end {
                    Some(end) => {
                        !is_min_rec(page, slot) && end.compare(&rec.key) != Ordering::Greater
                    }
                    None => false,
                };
                (rec.child, past_end)
            };
            if past_end {
                break;
            }

            let level_cursor = if at_level > read_level {
                let child = child.ok_or_else(|| index.corrupt(mtr.page(sp), "node pointer without child"))?;
                if depth < split_level {
                    self.create_ranges(range, child, depth + 1, split_level, ranges, mtr)?;
                    slot = mtr.page(sp).next_slot(slot);
                    continue;
                }
                self.start_range(child, start.as_ref(), &mut savepoints, mtr)?
            } else {
                // The page itself is on the read level.
                let page = mtr.page(sp);
                let slot = match &start {
                    Some(start) => page.search(start, PageCurMode::Ge),
                    None => page.first_slot(),
                };
                PageCursor { sp, slot }
            };

            if let Some(iter) = self.create_persistent_cursor(level_cursor, start.as_ref(), mtr) {
                if let Some(last) = ranges.last_mut() {
                    last.1 = iter.clone();
                }
                ranges.push((iter, Arc::new(Iter::default())));
            }

            // The range keeps its position in a stored cursor: the subtree can be released.
            for sp in savepoints.iter() {
                mtr.release_at_savepoint(*sp);
            }
            if depth == 0 && self.depth.load(AtomicOrdering::Relaxed) == 0 {
                self.depth.store(savepoints.len(), AtomicOrdering::Relaxed);
            }
            savepoints.clear();

            if at_level == read_level {
                break;
            }
            start = None;
            slot = mtr.page(sp).next_slot(slot);
        }

        mtr.release_at_savepoint(sp);
        Ok(())
    }

    /// Follows the leftmost path into the subtree at `page_no` that can hold `key`, down to the
    /// read level, and positions on the first record not below `key`.
    fn start_range(
        &self,
        mut page_no: PageNo,
        key: Option<&Tuple>,
        savepoints: &mut Vec<Savepoint>,
        mtr: &mut Mtr<'a>,
    ) -> Result<PageCursor> {
        let index = self.config.index;
        loop {
            let sp = mtr.push(index.fetch_required(page_no, LatchMode::Shared)?);
            savepoints.push(sp);
            let page = mtr.page(sp);

            if page.level() != 0 && page.level() != self.config.read_level {
                page_no = index.node_ptr_child(page, key, PageCurMode::Le)?;
                continue;
            }

            let slot = match key {
                Some(key) => page.search(key, PageCurMode::Ge),
                None => page.first_slot(),
            };
            return Ok(PageCursor { sp, slot });
        }
    }

    /// Stores a cursor on the first record of a range. A position past the last record of a
    /// page is stored as lying after that record, and the range is then bounded by `key`.
    /// Returns `None` for an empty root.
    fn create_persistent_cursor(&self, cur: PageCursor, key: Option<&Tuple>, mtr: &Mtr<'a>) -> Option<Arc<Iter>> {
        let page = mtr.page(cur.sp);
        if page.is_empty() {
            debug_assert_eq!(page.page_no(), self.config.index.root());
            return None;
        }
        let slot = skip_infimum(page, cur.slot);

        let tuple = match page.rec(slot) {
            Some(rec) => rec.key.prefix(self.config.index.n_unique()),
            None => key?.clone(),
        };

        let mut pcur = PersistentCursor::new(self.config.read_level);
        pcur.position(PageCursor { sp: cur.sp, slot });
        pcur.store_position(self.config.index, mtr);
        debug_assert!(matches!(pcur.rel_pos(), RelPos::On | RelPos::After));

        Some(Arc::new(Iter {
            tuple: Some(tuple),
            pcur: Mutex::new(Some(pcur)),
        }))
    }

    /// Queues one context per range. With more ranges than threads, the ranges that do not
    /// divide evenly among the threads are re-partitioned by the worker picking them up; so
    /// is every range of a deep tree partitioned into too few ranges.
    fn create_contexts(self: &Arc<Self>, ranges: Vec<Range>, reader: &ParallelReader<'a>) -> Result<()> {
        let split_point = split_point(
            ranges.len(),
            reader.max_threads.max(1),
            self.depth.load(AtomicOrdering::Relaxed),
            reader.config.split_threshold,
        );
        for (i, range) in ranges.into_iter().enumerate() {
            self.create_context(range, i >= split_point, reader)?;
        }
        Ok(())
    }

    fn create_context(self: &Arc<Self>, range: Range, split: bool, reader: &ParallelReader<'a>) -> Result<()> {
        let id = reader.ctx_id.fetch_add(1, AtomicOrdering::Relaxed);
        reader.enqueue(Ctx {
            id,
            scan: self.clone(),
            range,
            split,
        });
        Ok(())
    }
}

impl<'a> fmt::Debug for ScanCtx<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCtx")
            .field("id", &self.id)
            .field("index", &self.config.index.name())
            .field("range", &self.config.range)
            .field("read_level", &self.config.read_level)
            .field("err", &self.error())
            .finish()
    }
}

/// Index of the first range to re-partition at runtime.
pub(crate) fn split_point(n_ranges: usize, n_threads: usize, depth: usize, split_threshold: usize) -> usize {
    if n_ranges > n_threads {
        (n_ranges / n_threads) * n_threads
    } else if depth < split_threshold {
        // Splitting the subtrees of a shallow tree costs more than it saves.
        n_threads
    } else {
        0
    }
}

/// Runs scans with a pool of worker threads.
pub struct ParallelReader<'a> {
    max_threads: usize,
    n_threads: usize,
    sync: bool,
    config: ReaderConfig,
    scans: Vec<Arc<ScanCtx<'a>>>,
    queue: Mutex<VecDeque<Ctx<'a>>>,
    ctx_id: AtomicUsize,
    n_completed: AtomicUsize,
    err: Mutex<Option<Error>>,
    event: Event,
    sig_count: u64,
    start_callback: Option<ThreadFn<'a>>,
    finish_callback: Option<ThreadFn<'a>>,
    thread_ctxs: Mutex<Vec<ThreadCtx>>,
}

impl<'a> ParallelReader<'a> {
    /// A reader running on up to `max_threads` workers, which the caller obtained from
    /// [`ParallelReader::available_threads`]. The reader gives them back when dropped. Zero
    /// threads means the scans run on the calling thread.
    pub fn new(max_threads: usize) -> ParallelReader<'a> {
        Self::with_config(max_threads, ReaderConfig::default())
    }

    pub fn with_config(max_threads: usize, config: ReaderConfig) -> ParallelReader<'a> {
        let event = Event::new();
        let sig_count = event.reset();
        ParallelReader {
            max_threads,
            n_threads: max_threads,
            sync: max_threads == 0,
            config,
            scans: Vec::new(),
            queue: Mutex::new(VecDeque::new()),
            ctx_id: AtomicUsize::new(0),
            n_completed: AtomicUsize::new(0),
            err: Mutex::new(None),
            event,
            sig_count,
            start_callback: None,
            finish_callback: None,
            thread_ctxs: Mutex::new(Vec::new()),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Called when a thread, a context or a page is started. The state of the thread context
    /// tells which.
    pub fn set_start_callback(&mut self, f: impl Fn(&mut ThreadCtx) -> Result<()> + Send + Sync + 'a) {
        self.start_callback = Some(Box::new(f));
    }

    /// Called when a thread, a context or a page is finished.
    pub fn set_finish_callback(&mut self, f: impl Fn(&mut ThreadCtx) -> Result<()> + Send + Sync + 'a) {
        self.finish_callback = Some(Box::new(f));
    }

    /// Partitions a scan and queues its contexts. `f` is called for every visible record.
    pub fn add_scan(
        &mut self,
        trx: Option<&'a dyn Trx>,
        config: ScanConfig<'a>,
        f: impl Fn(&mut ExecCtx<'_>) -> Result<()> + Send + Sync + 'a,
    ) -> Result<()> {
        debug_assert!(!config.index.is_spatial());
        let scan = Arc::new(ScanCtx::new(self.scans.len(), trx, config, Box::new(f)));
        self.scans.push(scan.clone());

        let _s_lock = scan.index_s_lock();
        let mut ranges = Vec::new();
        scan.partition(&scan.config.range, &mut ranges, 0)?;
        if ranges.is_empty() {
            debug!("scan {}: nothing to read", scan.id);
            return Ok(());
        }
        scan.create_contexts(ranges, self)
    }

    pub fn scans(&self) -> &[Arc<ScanCtx<'a>>] {
        &self.scans
    }

    /// Thread contexts of the last run, callback contexts included.
    pub fn take_thread_ctxs(&mut self) -> Vec<ThreadCtx> {
        std::mem::take(&mut *self.thread_ctxs.lock())
    }

    /// The first error of the reader as a whole.
    pub fn error(&self) -> Option<Error> {
        self.err.lock().clone()
    }

    pub fn is_error_set(&self) -> bool {
        self.err.lock().is_some()
    }

    pub(crate) fn set_error_state(&self, err: Error) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            warn!("parallel read failed: {}", err);
            *slot = Some(err);
        }
    }

    fn enqueue(&self, ctx: Ctx<'a>) {
        self.queue.lock().push_back(ctx);
    }

    fn dequeue(&self) -> Option<Ctx<'a>> {
        self.queue.lock().pop_front()
    }

    fn is_queue_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Runs every queued context on `n_threads` workers and waits for them. Returns the first
    /// error of the reader or, failing that, of the first scan that failed.
    pub fn run(&mut self, n_threads: usize) -> Result<()> {
        debug_assert!(n_threads <= self.max_threads);
        let n_threads = n_threads.min(self.max_threads);
        if !self.sync && self.n_threads > n_threads {
            Self::release_threads(self.n_threads - n_threads);
            self.n_threads = n_threads;
        }
        if n_threads == 0 {
            self.sync = true;
        }

        if self.is_queue_empty() {
            debug!("parallel read: no contexts to run");
            return Ok(());
        }
        self.spawn(n_threads)?;

        if let Some(err) = self.error() {
            return Err(err);
        }
        for scan in &self.scans {
            if let Some(err) = scan.error() {
                return Err(err);
            }
        }
        info!(
            "parallel read of {} scans done: {} contexts on {} threads",
            self.scans.len(),
            self.n_completed.load(AtomicOrdering::Relaxed),
            n_threads
        );
        Ok(())
    }
}

impl<'a> Drop for ParallelReader<'a> {
    fn drop(&mut self) {
        if !self.sync {
            Self::release_threads(self.n_threads);
        }
    }
}

impl<'a> fmt::Debug for ParallelReader<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelReader")
            .field("max_threads", &self.max_threads)
            .field("n_threads", &self.n_threads)
            .field("sync", &self.sync)
            .field("scans", &self.scans)
            .field("err", &self.error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{btree, init_log, int_rec, key, load_tree, pk_rec};
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use serial_test::serial;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Keys delivered by every context, run with `n_threads` workers.
    fn scan_by_ctx(index: &Index, range: ScanRange, max_threads: usize, n_threads: usize) -> BTreeMap<usize, Vec<Tuple>> {
        let seen = Mutex::new(BTreeMap::<usize, Vec<Tuple>>::new());
        {
            let mut reader = ParallelReader::new(max_threads);
            let config = ScanConfig::new(index).with_range(range.start, range.end);
            reader
                .add_scan(None, config, |ctx| {
                    seen.lock()
                        .entry(ctx.ctx_id())
                        .or_default()
                        .push(ctx.record().key.clone());
                    Ok(())
                })
                .unwrap();
            reader.run(n_threads).unwrap();
        }
        seen.into_inner()
    }

    fn assert_exact_cover(by_ctx: &BTreeMap<usize, Vec<Tuple>>, expected: &[Tuple]) {
        let mut all: Vec<Tuple> = by_ctx.values().flatten().cloned().collect();
        let n = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), n, "a record was delivered twice");
        assert_eq!(all, expected);
        for keys in by_ctx.values() {
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }
    }

    fn deep_tree(n: i64) -> Index {
        let index = btree(4, 1);
        let mut keys: Vec<i64> = (0..n).collect();
        keys.shuffle(&mut thread_rng());
        for k in keys {
            index.insert(int_rec(k)).unwrap();
        }
        assert!(index.height().unwrap() >= 4);
        index
    }

    #[test]
    #[serial]
    fn ranges_cover_the_index_exactly() {
        init_log();
        let index = deep_tree(3_000);
        let expected: Vec<Tuple> = (0..3_000).map(key).collect();

        for n in [1, 2, 5, 17] {
            let granted = ParallelReader::available_threads(n, false);
            assert_eq!(granted, n);
            let by_ctx = scan_by_ctx(&index, ScanRange::default(), n, n);
            assert!(by_ctx.len() >= n.min(2), "{} threads, {} contexts", n, by_ctx.len());
            assert_exact_cover(&by_ctx, &expected);
        }
        assert_eq!(ParallelReader::active_threads(), 0);
    }

    #[test]
    #[serial]
    fn ranges_cover_a_bounded_scan() {
        let index = deep_tree(2_000);
        for (start, end) in [(100, 1_700), (0, 1), (555, 556), (1_990, 5_000)] {
            let expected: Vec<Tuple> = (start..end.min(2_000)).map(key).collect();
            let granted = ParallelReader::available_threads(5, false);
            let range = ScanRange {
                start: Some(key(start)),
                end: Some(key(end)),
            };
            let by_ctx = scan_by_ctx(&index, range, granted, granted);
            assert_exact_cover(&by_ctx, &expected);
        }
    }

    #[test]
    fn bounds_between_keys() {
        let index = btree(8, 1);
        for k in (0..500).map(|k| k * 2) {
            index.insert(int_rec(k)).unwrap();
        }
        let range = ScanRange {
            start: Some(key(101)),
            end: Some(key(201)),
        };
        let by_ctx = scan_by_ctx(&index, range, 0, 0);
        let expected: Vec<Tuple> = (51..101).map(|k| key(k * 2)).collect();
        assert_exact_cover(&by_ctx, &expected);
    }

    #[test]
    #[serial]
    fn every_record_once_for_any_thread_count() {
        let index = btree(16, 1);
        let mut keys: Vec<i64> = (0..5_000).collect();
        keys.shuffle(&mut thread_rng());
        for k in &keys {
            index.insert(int_rec(*k)).unwrap();
        }
        let baseline: Vec<Tuple> = index.scan_all().unwrap().into_iter().map(|r| r.key).collect();

        for n in [1, 2, 8] {
            let granted = ParallelReader::available_threads(n, false);
            let by_ctx = scan_by_ctx(&index, ScanRange::default(), granted, granted);
            assert_exact_cover(&by_ctx, &baseline);
        }
    }

    #[test]
    #[serial]
    fn fewer_threads_than_requested_still_scan_everything() {
        let index = deep_tree(1_500);
        let expected: Vec<Tuple> = (0..1_500).map(key).collect();

        let hog = ParallelReader::available_threads(MAX_THREADS - 2, false);
        assert_eq!(hog, MAX_THREADS - 2);
        let granted = ParallelReader::available_threads(8, false);
        assert_eq!(granted, 2);
        // The reserve is only handed out on request.
        assert_eq!(ParallelReader::available_threads(1, false), 0);

        let by_ctx = scan_by_ctx(&index, ScanRange::default(), granted, granted);
        assert_exact_cover(&by_ctx, &expected);

        // No budget at all: the calling thread does the work.
        let by_ctx = scan_by_ctx(&index, ScanRange::default(), 0, 0);
        assert_exact_cover(&by_ctx, &expected);

        ParallelReader::release_threads(hog);
        assert_eq!(ParallelReader::active_threads(), 0);
    }

    #[test]
    #[serial]
    fn ten_thousand_rows_on_four_threads() {
        init_log();
        let index = btree(100, 2);
        let records = (0..10_000).map(|i| pk_rec(i / 100, i % 100)).collect();
        index.bulk_load(records).unwrap();

        let calls = AtomicUsize::new(0);
        let by_thread = Mutex::new(BTreeMap::<usize, Vec<Tuple>>::new());
        let granted = ParallelReader::available_threads(4, false);
        assert_eq!(granted, 4);
        {
            let mut reader = ParallelReader::new(granted);
            reader
                .add_scan(None, ScanConfig::new(&index), |ctx| {
                    calls.fetch_add(1, AtomicOrdering::Relaxed);
                    let key = ctx.record().key.clone();
                    by_thread.lock().entry(ctx.thread_id()).or_default().push(key);
                    Ok(())
                })
                .unwrap();
            reader.run(granted).unwrap();
        }

        assert_eq!(calls.load(AtomicOrdering::Relaxed), 10_000);
        let by_thread = by_thread.into_inner();
        for keys in by_thread.values() {
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }
        let all: BTreeSet<Tuple> = by_thread.values().flatten().cloned().collect();
        assert_eq!(all.len(), 10_000);
        let expected: BTreeSet<Tuple> = (0..10_000).map(|i| Tuple::from_ints(&[i / 100, i % 100])).collect();
        assert_eq!(all, expected);
    }

    #[test]
    #[serial]
    fn row_callback_error_stops_the_scan() {
        let index = deep_tree(2_000);
        let granted = ParallelReader::available_threads(3, false);
        let calls = AtomicUsize::new(0);

        let mut reader = ParallelReader::new(granted);
        reader
            .add_scan(None, ScanConfig::new(&index), |ctx| {
                calls.fetch_add(1, AtomicOrdering::Relaxed);
                if ctx.record().key == key(700) {
                    return Err(Error::Callback("bad row".to_string()));
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(reader.run(granted).unwrap_err(), Error::Callback("bad row".to_string()));
        assert_eq!(reader.scans()[0].error(), Some(Error::Callback("bad row".to_string())));
        assert!(calls.load(AtomicOrdering::Relaxed) < 2_000);
    }

    #[test]
    fn thread_callback_error_is_reported() {
        let index = deep_tree(500);
        let mut reader = ParallelReader::new(0);
        reader.set_start_callback(|thread| match thread.state() {
            State::Ctx => Err(Error::Callback("no context today".to_string())),
            _ => Ok(()),
        });
        reader.add_scan(None, ScanConfig::new(&index), |_| Ok(())).unwrap();
        assert_eq!(
            reader.run(0).unwrap_err(),
            Error::Callback("no context today".to_string())
        );
    }

    struct Interruptible {
        after: usize,
        seen: AtomicUsize,
        interrupted: AtomicBool,
    }

    impl Trx for Interruptible {
        fn is_interrupted(&self) -> bool {
            self.interrupted.load(AtomicOrdering::Relaxed)
        }

        fn is_visible(&self, _rec: &Record) -> bool {
            if self.seen.fetch_add(1, AtomicOrdering::Relaxed) + 1 >= self.after {
                self.interrupted.store(true, AtomicOrdering::Relaxed);
            }
            true
        }
    }

    #[test]
    #[serial]
    fn interrupt_is_noticed_between_pages() {
        let index = deep_tree(3_000);
        let trx = Interruptible {
            after: 100,
            seen: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
        };
        let config = ReaderConfig {
            interrupt_probe_pages: 1,
            ..ReaderConfig::default()
        };
        let calls = AtomicUsize::new(0);
        let granted = ParallelReader::available_threads(2, false);

        let mut reader = ParallelReader::with_config(granted, config);
        reader
            .add_scan(Some(&trx), ScanConfig::new(&index), |_| {
                calls.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(())
            })
            .unwrap();
        assert_eq!(reader.run(granted).unwrap_err(), Error::Interrupted);
        assert!(calls.load(AtomicOrdering::Relaxed) < 3_000);
    }

    struct HideOdd;

    impl Trx for HideOdd {
        fn is_visible(&self, rec: &Record) -> bool {
            rec.trx_id % 2 == 0
        }
    }

    #[test]
    fn invisible_and_delete_marked_rows_are_skipped() {
        let index = btree(8, 1);
        for k in 0..100 {
            let mut rec = int_rec(k);
            rec.trx_id = k as u64;
            index.insert(rec).unwrap();
        }
        for k in (0..100).step_by(10) {
            index.delete_mark(&key(k), true).unwrap();
        }

        let seen = Mutex::new(Vec::new());
        let mut reader = ParallelReader::new(0);
        reader
            .add_scan(Some(&HideOdd), ScanConfig::new(&index), |ctx| {
                seen.lock().push(ctx.record().key.clone());
                Ok(())
            })
            .unwrap();
        reader.run(0).unwrap();
        drop(reader);

        let expected: Vec<Tuple> = (0..100)
            .filter(|k| k % 2 == 0 && k % 10 != 0)
            .map(key)
            .collect();
        assert_eq!(seen.into_inner(), expected);
    }

    #[test]
    fn level_one_scan_visits_every_leaf_once() {
        let index = deep_tree(2_000);
        let leaves: BTreeSet<PageNo> = index.pages_at_level(0).unwrap().into_iter().collect();

        let seen = Mutex::new(Vec::new());
        let mut reader = ParallelReader::new(0);
        reader
            .add_scan(None, ScanConfig::new(&index).with_read_level(1), |ctx| {
                assert_eq!(ctx.page().level(), 1);
                seen.lock().push(ctx.record().child.unwrap());
                Ok(())
            })
            .unwrap();
        reader.run(0).unwrap();
        drop(reader);

        let seen = seen.into_inner();
        assert_eq!(seen.len(), leaves.len());
        assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), leaves);
    }

    #[test]
    fn level_one_callbacks_run_without_the_tree_lock() {
        let index = deep_tree(1_000);
        let n_leaves = index.pages_at_level(0).unwrap().len();
        let wait = std::time::Duration::from_secs(2);
        let x_locked = |_: &mut ThreadCtx| match index.lock().try_exclusive_for(wait) {
            Some(_) => Ok(()),
            None => Err(Error::Callback("tree lock held during a callback".to_string())),
        };

        let rows = AtomicUsize::new(0);
        let mut reader = ParallelReader::new(0);
        reader.set_start_callback(x_locked);
        reader.set_finish_callback(x_locked);
        reader
            .add_scan(None, ScanConfig::new(&index).with_read_level(1), |_| {
                match index.lock().try_exclusive_for(wait) {
                    Some(_) => {
                        rows.fetch_add(1, AtomicOrdering::Relaxed);
                        Ok(())
                    }
                    None => Err(Error::Callback("tree lock held during a row".to_string())),
                }
            })
            .unwrap();
        reader.run(0).unwrap();
        assert_eq!(rows.load(AtomicOrdering::Relaxed), n_leaves);
    }

    #[test]
    #[serial]
    fn level_one_scan_lets_writers_through() {
        let index = deep_tree(2_000);
        let inserted = AtomicUsize::new(0);
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                for k in 2_000..2_400 {
                    index.insert(int_rec(k)).unwrap();
                    inserted.fetch_add(1, AtomicOrdering::Relaxed);
                }
                done.store(true, AtomicOrdering::Release);
            });

            let granted = ParallelReader::available_threads(2, false);
            let mut reader = ParallelReader::new(granted);
            reader
                .add_scan(None, ScanConfig::new(&index).with_read_level(1), |_| {
                    thread::yield_now();
                    Ok(())
                })
                .unwrap();
            reader.run(granted).unwrap();
        });

        assert!(done.load(AtomicOrdering::Acquire));
        assert_eq!(inserted.load(AtomicOrdering::Relaxed), 400);
        index.validate().unwrap();
    }

    #[test]
    fn callbacks_follow_the_state_machine() {
        let index = deep_tree(600);
        let events = Mutex::new(Vec::new());

        let mut reader = ParallelReader::new(0);
        reader.set_start_callback(|thread| {
            events.lock().push((true, thread.state()));
            Ok(())
        });
        reader.set_finish_callback(|thread| {
            events.lock().push((false, thread.state()));
            Ok(())
        });
        let rows = AtomicUsize::new(0);
        let firsts = AtomicUsize::new(0);
        reader
            .add_scan(None, ScanConfig::new(&index), |ctx| {
                rows.fetch_add(1, AtomicOrdering::Relaxed);
                if ctx.is_first_rec_on_page() {
                    firsts.fetch_add(1, AtomicOrdering::Relaxed);
                }
                Ok(())
            })
            .unwrap();
        reader.run(0).unwrap();
        drop(reader);

        let events = events.into_inner();
        assert_eq!(events.first(), Some(&(true, State::Thread)));
        assert_eq!(events.last(), Some(&(false, State::Thread)));
        let count = |e: (bool, State)| events.iter().filter(|x| **x == e).count();
        assert_eq!(count((true, State::Ctx)), count((false, State::Ctx)));
        assert_eq!(count((true, State::Page)), count((false, State::Page)));
        assert_eq!(rows.load(AtomicOrdering::Relaxed), 600);
        assert_eq!(firsts.load(AtomicOrdering::Relaxed), index.pages_at_level(0).unwrap().len());

        // Every page is opened and closed inside its context.
        let mut depth = 0i32;
        for (start, state) in &events[1..events.len() - 1] {
            match (start, state) {
                (true, State::Ctx) => {
                    assert_eq!(depth, 0);
                    depth = 1;
                }
                (false, State::Ctx) => {
                    assert_eq!(depth, 1);
                    depth = 0;
                }
                (true, State::Page) => {
                    assert_eq!(depth, 1);
                    depth = 2;
                }
                (false, State::Page) => {
                    assert_eq!(depth, 2);
                    depth = 1;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn empty_index_runs_nothing() {
        let index = btree(8, 1);
        let mut reader = ParallelReader::new(0);
        reader
            .add_scan(None, ScanConfig::new(&index), |_| panic!("no rows expected"))
            .unwrap();
        reader.run(0).unwrap();
    }

    #[test]
    fn several_scans_share_the_workers() {
        let a = deep_tree(800);
        let b = btree(8, 1);
        for k in 0..300 {
            b.insert(int_rec(k)).unwrap();
        }
        let seen = Mutex::new(BTreeMap::<usize, usize>::new());
        let mut reader = ParallelReader::new(0);
        for (i, index) in [&a, &b].into_iter().enumerate() {
            let config = ScanConfig::new(index).with_partition_id(i * 10);
            reader
                .add_scan(None, config, |ctx| {
                    assert_eq!(ctx.partition_id(), Some(ctx.scan_id() * 10));
                    *seen.lock().entry(ctx.scan_id()).or_default() += 1;
                    Ok(())
                })
                .unwrap();
        }
        reader.run(0).unwrap();
        drop(reader);
        assert_eq!(seen.into_inner(), BTreeMap::from([(0, 800), (1, 300)]));
    }

    fn ignore_row(_: &mut ExecCtx<'_>) -> Result<()> {
        Ok(())
    }

    #[test]
    fn fixed_layout_partitions_per_subtree() {
        let index = load_tree("fixtures/three_levels.json");
        index.validate().unwrap();
        assert_eq!(index.height().unwrap(), 3);

        let scan = Arc::new(ScanCtx::new(0, None, ScanConfig::new(&index), Box::new(ignore_row)));
        let _s_lock = scan.index_s_lock();

        let mut ranges = Vec::new();
        scan.partition(&ScanRange::default(), &mut ranges, 0).unwrap();
        let starts: Vec<_> = ranges.iter().map(|r| r.0.tuple.clone().unwrap()).collect();
        assert_eq!(starts, vec![key(1), key(20), key(40)]);
        // Every range ends where the next one starts.
        for pair in ranges.windows(2) {
            assert!(Arc::ptr_eq(&pair[0].1, &pair[1].0));
        }
        assert!(ranges[2].1.tuple.is_none());
        assert_eq!(scan.depth.load(AtomicOrdering::Relaxed), 2);

        let mut ranges = Vec::new();
        scan.partition(&ScanRange::default(), &mut ranges, 1).unwrap();
        let starts: Vec<_> = ranges.iter().map(|r| r.0.tuple.clone().unwrap()).collect();
        assert_eq!(starts, vec![key(1), key(10), key(20), key(30), key(40), key(45), key(50)]);

        // A start past the last record of a leaf resumes after that record.
        let mut ranges = Vec::new();
        let range = ScanRange {
            start: Some(key(8)),
            end: Some(key(31)),
        };
        scan.partition(&range, &mut ranges, 1).unwrap();
        let starts: Vec<_> = ranges.iter().map(|r| r.0.tuple.clone().unwrap()).collect();
        assert_eq!(starts, vec![key(8), key(10), key(20), key(30)]);
        assert_eq!(ranges[0].0.pcur.lock().as_ref().unwrap().rel_pos(), RelPos::After);
        assert_eq!(ranges[3].1.tuple, Some(key(31)));
    }

    #[test]
    fn first_pointer_of_inner_page_is_no_end_bound() {
        let index = load_tree("fixtures/three_levels.json");
        let middle = index.pages_at_level(1).unwrap()[1];
        {
            // As left behind when the pointer before it was removed: above its child's keys.
            let mut page = index.fetch(middle, LatchMode::Exclusive).unwrap();
            assert_eq!(page.records()[0].key, key(20));
            page.page_mut().records[0].key = key(28);
        }
        index.validate().unwrap();

        let scan = Arc::new(ScanCtx::new(0, None, ScanConfig::new(&index), Box::new(ignore_row)));
        let _s_lock = scan.index_s_lock();
        let mut ranges = Vec::new();
        let range = ScanRange {
            start: Some(key(21)),
            end: Some(key(26)),
        };
        scan.partition(&range, &mut ranges, 1).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].0.tuple, Some(key(22)));
        assert_eq!(ranges[0].1.tuple, Some(key(26)));
    }

    #[test]
    fn split_point_rule() {
        // More ranges than threads: the remainder is split.
        assert_eq!(split_point(10, 4, 1, 3), 8);
        assert_eq!(split_point(8, 4, 5, 3), 8);
        // Few ranges of a shallow tree: nothing is split.
        assert_eq!(split_point(3, 4, 2, 3), 4);
        // Few ranges of a deep tree: everything is split.
        assert_eq!(split_point(3, 4, 3, 3), 0);
    }

    #[test]
    #[serial]
    fn concurrent_inserts_during_scan() {
        init_log();
        let index = btree(8, 1);
        for k in (0..4_000).map(|k| k * 2) {
            index.insert(int_rec(k)).unwrap();
        }
        let granted = ParallelReader::available_threads(4, false);
        let seen = Mutex::new(Vec::new());

        thread::scope(|s| {
            s.spawn(|| {
                let mut odd: Vec<i64> = (0..4_000).map(|k| k * 2 + 1).collect();
                odd.shuffle(&mut thread_rng());
                for k in odd {
                    index.insert(int_rec(k)).unwrap();
                }
            });

            let mut reader = ParallelReader::new(granted);
            reader
                .add_scan(None, ScanConfig::new(&index), |ctx| {
                    seen.lock().push(ctx.record().key.clone());
                    Ok(())
                })
                .unwrap();
            reader.run(granted).unwrap();
        });

        let mut seen = seen.into_inner();
        let n = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), n, "a record was delivered twice");
        // Every record present before the scan started is delivered.
        for k in (0..4_000).map(|k| k * 2) {
            assert!(seen.binary_search(&key(k)).is_ok(), "{} missing", k);
        }
        index.validate().unwrap();
    }
}
