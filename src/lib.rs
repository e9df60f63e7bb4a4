//! Page-latched index trees with persistent cursors, spatial search and parallel range scans.
//!
//! Indexes live as pages in a shared [`BufferPool`]. Every access goes through a
//! mini-transaction ([`mtr::Mtr`]) that owns the page latches it took. Positions survive
//! releasing their latches in a [`pcur::PersistentCursor`], which is what lets long scans give
//! way to writers.
//!
//! Two readers are built on top:
//! - [`rtree::RtrCursor`] searches spatial indexes, where overlapping subtrees force a search
//!   to keep a stack of pages still to visit and to repair it when pages split or disappear;
//! - [`pread::ParallelReader`] splits a clustered index into key ranges and scans them on a
//!   bounded pool of worker threads.

pub mod btree;
pub mod buffer;
pub mod config;
pub mod error;
pub mod latch;
pub mod mtr;
pub mod page;
pub mod pcur;
pub mod pread;
pub mod rtree;

#[cfg(test)]
mod util;

pub use btree::{Index, IndexKind, PageCursor};
pub use buffer::{BufferPool, LatchMode};
pub use config::{IndexConfig, ReaderConfig};
pub use error::{Error, Result};
pub use page::{Field, PageNo, Record, Tuple};
pub use pread::{ParallelReader, ScanConfig, Trx};
pub use rtree::{Mbr, RtrCursor, SearchMode};
