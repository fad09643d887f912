//! Block cache subsystem.
//!
//! [`cached_block::CachedBlock`] is one decompressible block with an
//! incrementally growing uncompressed prefix; [`block_cache::BlockCache`]
//! is the LRU cache coordinating concurrent requests over them.  A
//! [`BlockRange`] is the holder handed to consumers: it pins its block
//! against deallocation (eviction from the LRU only drops the cache's own
//! reference) and derefs to the requested bytes.

pub mod block_cache;
pub mod cached_block;

pub use block_cache::{BlockCache, BlockCacheStats};
pub use cached_block::CachedBlock;

use std::sync::Arc;
use std::time::Duration;

use crate::codec::PayloadRef;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BlockCacheOptions {
    /// Soft memory budget; `max_blocks = max(1, max_bytes / block_size)`.
    pub max_bytes: usize,
    /// Decompression worker threads (0 = one per CPU).
    pub num_workers: usize,
    /// When the last pending request of a set needs more than this fraction
    /// of the block, decompress the whole block instead.
    pub decompress_ratio: f64,
    /// Hint the OS to drop compressed source pages once a block is fully
    /// decompressed.
    pub mm_release: bool,
    /// Skip section verification on first access.
    pub disable_block_integrity_check: bool,
    /// Spawn the worker pool at construction.
    pub init_workers: bool,
    /// Window size of the sequential access detector; 0 disables it.
    pub sequential_access_detector_threshold: usize,
}

impl Default for BlockCacheOptions {
    fn default() -> Self {
        Self {
            max_bytes: 512 << 20,
            num_workers: 0,
            decompress_ratio: 0.8,
            mm_release: false,
            disable_block_integrity_check: false,
            init_workers: true,
            sequential_access_detector_threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheTidyStrategy {
    #[default]
    None,
    /// Drop blocks unused for `expiry_time`.
    ExpiryTime,
    /// Drop blocks whose pages the OS has reclaimed.
    BlockSwappedOut,
}

#[derive(Debug, Clone)]
pub struct CacheTidyConfig {
    pub strategy: CacheTidyStrategy,
    pub interval: Duration,
    pub expiry_time: Duration,
}

impl Default for CacheTidyConfig {
    fn default() -> Self {
        Self {
            strategy: CacheTidyStrategy::None,
            interval: Duration::from_secs(1),
            expiry_time: Duration::from_secs(60),
        }
    }
}

// ── BlockRange ───────────────────────────────────────────────────────────────

/// A consumer's view of one byte range of a block.
///
/// Holding a `BlockRange` keeps the underlying block alive; the cache may
/// evict the block from its LRU, but the data stays valid until every
/// holder is gone.
#[derive(Clone)]
pub struct BlockRange {
    source: BlockSource,
    offset: usize,
    size: usize,
}

#[derive(Clone)]
enum BlockSource {
    Cached(Arc<CachedBlock>),
    /// Uncompressed sections bypass the cache; the range views the mapped
    /// image directly.
    Mapped(PayloadRef),
}

impl BlockRange {
    pub(crate) fn cached(block: Arc<CachedBlock>, offset: usize, size: usize) -> Self {
        BlockRange {
            source: BlockSource::Cached(block),
            offset,
            size,
        }
    }

    pub(crate) fn mapped(payload: PayloadRef, offset: usize, size: usize) -> Self {
        BlockRange {
            source: BlockSource::Mapped(payload),
            offset,
            size,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.source {
            BlockSource::Cached(block) => block.data(self.offset, self.size),
            BlockSource::Mapped(payload) => &payload.bytes()[self.offset..self.offset + self.size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl std::ops::Deref for BlockRange {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl std::fmt::Debug for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockRange({} B at {})", self.size, self.offset)
    }
}
