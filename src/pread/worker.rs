//! Worker threads of the parallel reader and the process-wide thread budget.

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use super::{ParallelReader, State, ThreadCtx, ThreadFn};
use crate::error::{Error, Result};

/// Worker threads all readers of the process may run at once.
pub const MAX_THREADS: usize = 256;

/// Threads only handed out to callers asking for the reserve.
pub const MAX_RESERVED_THREADS: usize = 16;

pub const MAX_TOTAL_THREADS: usize = MAX_THREADS + MAX_RESERVED_THREADS;

static ACTIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Manual-reset event. A waiter passes the count returned by the reset that preceded its last
/// look at the shared state, so a set happening in between is never missed.
pub(crate) struct Event {
    state: Mutex<(bool, u64)>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event {
            state: Mutex::new((false, 0)),
            cond: Condvar::new(),
        }
    }

    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.0 = false;
        state.1
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        if !state.0 {
            state.0 = true;
            state.1 += 1;
            self.cond.notify_all();
        }
    }

    pub fn wait(&self, sig_count: u64) {
        let mut state = self.state.lock();
        while !state.0 && state.1 == sig_count {
            self.cond.wait(&mut state);
        }
    }
}

impl<'a> ParallelReader<'a> {
    /// Reserves up to `n_required` worker threads from the process budget and returns how many
    /// were granted, possibly zero. The reserve on top of [`MAX_THREADS`] is only drawn from
    /// with `use_reserved`.
    pub fn available_threads(n_required: usize, use_reserved: bool) -> usize {
        let max_threads = if use_reserved {
            MAX_TOTAL_THREADS
        } else {
            MAX_THREADS
        };

        let active = ACTIVE_THREADS.fetch_add(n_required, Ordering::Relaxed);
        if active < max_threads {
            let available = max_threads - active;
            if n_required <= available {
                return n_required;
            }
            ACTIVE_THREADS.fetch_sub(n_required - available, Ordering::Relaxed);
            return available;
        }

        ACTIVE_THREADS.fetch_sub(n_required, Ordering::Relaxed);
        0
    }

    /// Gives back threads obtained from [`ParallelReader::available_threads`].
    pub fn release_threads(n_threads: usize) {
        let active = ACTIVE_THREADS.fetch_sub(n_threads, Ordering::Relaxed);
        debug_assert!(active >= n_threads);
    }

    /// Threads currently reserved by all readers.
    pub fn active_threads() -> usize {
        ACTIVE_THREADS.load(Ordering::Relaxed)
    }

    pub(super) fn callback(&self, f: &Option<ThreadFn<'a>>, thread: &mut ThreadCtx, state: State) -> Result<()> {
        thread.state = state;
        match f {
            Some(f) => f(thread),
            None => Ok(()),
        }
    }

    /// Runs the workers and waits for all of them. Worker panics are propagated.
    pub(super) fn spawn(&self, n_threads: usize) -> Result<()> {
        if self.sync {
            self.event.set();
            let thread = self.worker(ThreadCtx::new(0));
            self.thread_ctxs.lock().push(thread);
            return Ok(());
        }

        let mut spawn_err = None;
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(n_threads);
            for i in 0..n_threads {
                let spawned = thread::Builder::new()
                    .name(format!("pread-{}", i))
                    .spawn_scoped(s, move || self.worker(ThreadCtx::new(i)));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        let err = Error::OutOfResources(e.to_string());
                        self.set_error_state(err.clone());
                        spawn_err = Some(err);
                        break;
                    }
                }
            }

            // Workers start once every one of them was spawned.
            self.event.set();

            for handle in handles {
                match handle.join() {
                    Ok(thread) => self.thread_ctxs.lock().push(thread),
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
        });

        match spawn_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pops and runs contexts until every context of the reader completed or an error was
    /// raised.
    fn worker(&self, mut thread: ThreadCtx) -> ThreadCtx {
        let mut err = self.callback(&self.start_callback, &mut thread, State::Thread);
        if err.is_ok() && !self.sync {
            self.event.wait(self.sig_count);
        }
        trace!("parallel read worker {} started", thread.id());

        let mut n_completed = 0;
        while err.is_ok() && !self.is_error_set() {
            let sig_count = self.event.reset();

            while !self.is_error_set() {
                let ctx = match self.dequeue() {
                    Some(ctx) => ctx,
                    None => break,
                };

                if ctx.scan.is_error_set() {
                    // The rest of a failed scan is dropped.
                    n_completed += 1;
                    continue;
                }

                if ctx.split {
                    err = ctx.split(self);
                    // New contexts to pick up.
                    self.event.set();
                } else {
                    err = self.callback(&self.start_callback, &mut thread, State::Ctx);
                    if err.is_ok() {
                        err = ctx.traverse(&mut thread, self);
                    }
                    let finished = self.callback(&self.finish_callback, &mut thread, State::Ctx);
                    if err.is_ok() {
                        err = finished;
                    }
                }
                n_completed += 1;

                if err.is_ok() && ctx.scan.is_interrupted() {
                    err = Err(Error::Interrupted);
                }
                if let Err(e) = &err {
                    ctx.scan.set_error_state(e.clone());
                    break;
                }
            }

            let done = self.n_completed.fetch_add(n_completed, Ordering::AcqRel) + n_completed;
            n_completed = 0;
            if done == self.ctx_id.load(Ordering::Acquire) {
                self.event.set();
                break;
            }
            if err.is_err() || self.is_error_set() {
                break;
            }
            if !self.sync {
                self.event.wait(sig_count);
            }
        }

        if let Err(e) = err {
            self.set_error_state(e);
        }
        if self.is_error_set() {
            // Wake up the others so they notice.
            self.event.set();
        }

        let finished = self.callback(&self.finish_callback, &mut thread, State::Thread);
        if let Err(e) = finished {
            self.set_error_state(e);
        }
        debug!("parallel read worker {} done", thread.id());
        thread
    }
}
