use thiserror::Error;

use crate::page::PageId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("optimistic validation failed")]
    Unwind,
    #[error("latch not available without waiting")]
    LockWouldBlock,
    #[error("end of index reached")]
    EndOfIndex,
    #[error("operation interrupted")]
    Interrupted,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of resources: {0}")]
    OutOfResources(String),
    #[error("duplicate key")]
    DuplicateKey,
    #[error("index {0} is not empty")]
    NotEmpty(String),
    #[error("page {0} not found")]
    PageNotFound(PageId),
    #[error("index corruption: {0}")]
    Corruption(String),
    #[error("callback failed: {0}")]
    Callback(String),
}

pub type Result<T> = std::result::Result<T, Error>;
