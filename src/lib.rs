//! # dwarfs — read-optimized, deduplicating, compressed filesystem images
//!
//! A source tree is scanned once, deduplicated at the file level,
//! compressed in large blocks, and written to a single immutable image
//! that can be mounted, extracted, or randomly read by inode and offset
//! with small, bounded memory.
//!
//! Format guarantees (frozen for major version 2):
//! - All numeric fields are little-endian; never negotiated
//! - Every v2 section header carries an XXH3-64 checksum and a
//!   SHA-512/256 digest; metadata corruption is always fatal, HISTORY
//!   corruption never is
//! - Section numbers are contiguous from 0; the final section is always
//!   the section index, giving O(1) section lookup without scanning
//! - Compressed payloads carry a varint uncompressed-size prefix, so
//!   readers size buffers without consulting the codec
//! - Unknown section and compression types are tolerated until accessed
//! - Identical output for identical input: block emission is merged
//!   deterministically regardless of worker count
//!
//! The read path: image bytes → sections → block cache (lazy, partial
//! decompression with LRU eviction) → inode reader (chunk walk, offset
//! cache, readahead) → [`Filesystem`].  The write path: source tree →
//! file scanner (two-tier dedup) → per-category block filling → parallel
//! compression through the deterministic block merger → sections.

pub mod cache;
pub mod checksum;
pub mod codec;
pub mod error;
pub mod history;
pub mod image;
pub mod inode_reader;
pub mod lru;
pub mod merger;
pub mod metadata;
pub mod oneshot;
pub mod os;
pub mod reader;
pub mod rewrite;
pub mod scanner;
pub mod section;
pub mod worker;
pub mod writer;

// Flat re-exports for the most common types.
pub use cache::{BlockCache, BlockCacheOptions, BlockCacheStats, BlockRange, CacheTidyConfig,
                CacheTidyStrategy};
pub use checksum::HashAlgorithm;
pub use codec::{CodecError, CompressionConstraints, Registry, Requirements};
pub use error::{CacheError, DwarfsError, Result};
pub use history::{History, HistoryEntry};
pub use image::ImageData;
pub use inode_reader::{InodeReader, InodeReaderOptions, IovecReadBuf};
pub use merger::{MergedBlockHolder, MultiQueueBlockMerger};
pub use metadata::{FileStat, InodeRank, InodeView, Metadata, MetadataError, MetadataView};
pub use os::{OsAccess, RealOs};
pub use reader::{Filesystem, FilesystemOptions, StatVfs};
pub use rewrite::{rewrite_filesystem, RewriteOptions};
pub use scanner::{FileScanner, Progress, ScanFile};
pub use section::{CompressionType, Section, SectionError, SectionType, VerifyLevel};
pub use writer::{Categorizer, FilesystemWriter, WriteReport, WriterOptions};
