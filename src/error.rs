//! Crate-wide error types.
//!
//! Each subsystem has its own `thiserror` enum (`SectionError`, `CodecError`,
//! `MetadataError`, `CacheError`); everything converges into [`DwarfsError`]
//! at the public API boundary.  Background prefetches never surface errors —
//! they are hints only.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::metadata::MetadataError;
use crate::section::SectionError;

/// Errors surfaced while reading blocks through the cache.
///
/// This type is `Clone` because a single decompression failure may have to be
/// delivered to every request waiting on the same block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("block number out of range: {0} >= {1}")]
    BlockOutOfRange(usize, usize),
    /// Decompression of a block payload failed.  The affected read fails;
    /// the cache does not retry.
    #[error("bad compression in block {block_no}: {reason}")]
    BadCompression { block_no: usize, reason: String },
    #[error("block {0} failed integrity check")]
    IntegrityCheckFailed(usize),
    #[error("request range {end} exceeds block {block_no} size {block_size}")]
    RequestOutOfRange {
        block_no: usize,
        end: usize,
        block_size: usize,
    },
    /// The worker fulfilling this request went away without an answer.
    #[error("block request abandoned")]
    Abandoned,
}

#[derive(Error, Debug)]
pub enum DwarfsError {
    #[error(transparent)]
    Section(#[from] SectionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Negative offsets, zero block sizes, inconsistent option combinations.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// ENOENT-style lookup failure on the public API.
    #[error("no such file or directory: {0}")]
    NotFound(String),
    /// EINVAL-style type mismatch (readlink on a non-symlink, open on a
    /// directory, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DwarfsError>;

impl DwarfsError {
    /// Map to the closest POSIX errno, for mount front-ends layered on top.
    pub fn os_errno(&self) -> i32 {
        match self {
            DwarfsError::InvalidArgument(_) | DwarfsError::InvalidOperation(_) => 22, // EINVAL
            DwarfsError::NotFound(_) => 2,                                            // ENOENT
            DwarfsError::Io(e) => e.raw_os_error().unwrap_or(5),
            _ => 5, // EIO
        }
    }
}
