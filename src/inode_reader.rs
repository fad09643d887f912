//! Inode reader — turns `(inode, offset, size)` into block-range futures.
//!
//! File metadata stores a flat chunk list per inode, so random access means
//! walking chunks until the byte offset is found; naive sequential reads of
//! a fragmented file would be O(n²) in chunk count.  Two caches fix that:
//!
//! - a per-inode **offset cache** (for files with at least
//!   [`OFFSET_CACHE_CHUNK_INDEX_INTERVAL`] chunks) storing the absolute
//!   file offset every interval chunks, so a read can binary-search close
//!   to its chunk and finish with a short linear scan.  Each entry also
//!   remembers the most recently used chunk, which makes strictly
//!   sequential reads O(1).
//! - a per-inode **readahead position** so sequential scans do not issue
//!   the same background prefetches twice.
//!
//! Offsets behave like `lseek(2)`/`read(2)`: negative offsets are an
//! error, reads at or past EOF return empty results with no error.

use std::sync::{Arc, Mutex};

use log::error;

use crate::cache::{BlockCache, BlockRange, CacheTidyConfig};
use crate::error::{DwarfsError, Result};
use crate::lru::LruMap;
use crate::metadata::Chunk;
use crate::oneshot::BlockFuture;

/// Chunk-count threshold above which the offset cache is consulted, and
/// the spacing of saved offsets.
pub const OFFSET_CACHE_CHUNK_INDEX_INTERVAL: usize = 256;
const OFFSET_CACHE_SIZE: usize = 64;
const READAHEAD_CACHE_SIZE: usize = 64;

/// Read every chunk in one call (no iovec ceiling).
pub const READ_ALL_IOV: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Default)]
pub struct InodeReaderOptions {
    /// Bytes to prefetch past the end of each read; 0 disables readahead.
    pub readahead: u64,
}

// ── Offset cache ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct OffsetCacheEntry {
    /// `offsets[k]` = absolute file offset of chunk `(k + 1) * INTERVAL`.
    offsets: Vec<u64>,
    /// Most recent `(chunk_index, chunk_start_offset, chunk_size)`.
    last: Option<(usize, u64, u64)>,
}

impl OffsetCacheEntry {
    /// Best known starting point for `offset`: `(chunk_index, file offset
    /// of that chunk)`.
    fn find(&self, offset: u64) -> (usize, u64) {
        if let Some((idx, start, size)) = self.last {
            if offset >= start && offset < start + size {
                return (idx, start);
            }
        }
        match self.offsets.partition_point(|&o| o <= offset) {
            0 => (0, 0),
            k => (k * OFFSET_CACHE_CHUNK_INDEX_INTERVAL, self.offsets[k - 1]),
        }
    }

    fn record(&mut self, chunk_index: usize, chunk_offset: u64) {
        debug_assert!(chunk_index % OFFSET_CACHE_CHUNK_INDEX_INTERVAL == 0 && chunk_index > 0);
        let slot = chunk_index / OFFSET_CACHE_CHUNK_INDEX_INTERVAL - 1;
        if slot < self.offsets.len() {
            debug_assert_eq!(self.offsets[slot], chunk_offset);
        } else if slot == self.offsets.len() {
            self.offsets.push(chunk_offset);
        }
        // a gap means the scan started mid-file; nothing to record
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct InodeReader {
    cache: BlockCache,
    opts: InodeReaderOptions,
    offset_cache: Mutex<LruMap<u32, Arc<Mutex<OffsetCacheEntry>>>>,
    readahead_cache: Mutex<LruMap<u32, u64>>,
}

/// Scatter-read result: one [`BlockRange`] per chunk touched, in file
/// order.  Each range derefs to its bytes.
#[derive(Default)]
pub struct IovecReadBuf {
    pub ranges: Vec<BlockRange>,
}

impl IovecReadBuf {
    pub fn total_size(&self) -> usize {
        self.ranges.iter().map(BlockRange::size).sum()
    }
}

impl InodeReader {
    pub fn new(cache: BlockCache, opts: InodeReaderOptions) -> Self {
        Self {
            cache,
            opts,
            offset_cache: Mutex::new(LruMap::new(OFFSET_CACHE_SIZE)),
            readahead_cache: Mutex::new(LruMap::new(READAHEAD_CACHE_SIZE)),
        }
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn num_blocks(&self) -> usize {
        self.cache.block_count()
    }

    pub fn set_num_workers(&self, num: usize) {
        self.cache.set_num_workers(num);
    }

    pub fn set_cache_tidy_config(&self, cfg: CacheTidyConfig) {
        self.cache.set_tidy_config(cfg);
    }

    // ── Core routine ─────────────────────────────────────────────────────────

    /// Issue cache requests for `size` bytes at `read_offset`, at most
    /// `maxiov` of them.  This is the shared core of all read flavors.
    pub fn readv_futures(
        &self,
        inode: u32,
        size: usize,
        read_offset: i64,
        maxiov: usize,
        chunks: &[Chunk],
    ) -> Result<Vec<BlockFuture<BlockRange>>> {
        let mut ranges = Vec::new();

        if read_offset < 0 {
            // exactly how lseek(2) treats an offset before the start
            return Err(DwarfsError::InvalidArgument(format!(
                "negative read offset {read_offset}"
            )));
        }
        if size == 0 || chunks.is_empty() {
            return Ok(ranges);
        }

        let read_offset = read_offset as u64;
        let mut offset = read_offset;

        let mut it = 0usize;
        let mut it_offset = 0u64;

        let use_offset_cache = offset > 0 && chunks.len() >= OFFSET_CACHE_CHUNK_INDEX_INTERVAL;
        let cache_entry = if use_offset_cache {
            let entry = {
                let mut oc = self.offset_cache.lock().unwrap();
                oc.get(&inode).cloned().unwrap_or_else(|| {
                    let e = Arc::new(Mutex::new(OffsetCacheEntry::default()));
                    oc.insert(inode, Arc::clone(&e));
                    e
                })
            };
            let (idx, base) = entry.lock().unwrap().find(offset);
            it = idx;
            it_offset = base;
            offset -= base;
            Some(entry)
        } else {
            None
        };

        // find the first chunk containing data of this request
        while it < chunks.len() {
            let chunksize = u64::from(chunks[it].size);
            if offset < chunksize {
                break;
            }
            offset -= chunksize;
            it_offset += chunksize;
            it += 1;
            if let Some(entry) = &cache_entry {
                if it % OFFSET_CACHE_CHUNK_INDEX_INTERVAL == 0 {
                    entry.lock().unwrap().record(it, it_offset);
                }
            }
        }

        if it == chunks.len() {
            // at or past EOF: empty result, no error (read(2) semantics)
            return Ok(ranges);
        }

        let mut num_read = 0usize;
        while it < chunks.len() {
            let chunk = chunks[it];
            let chunksize = u64::from(chunk.size);
            debug_assert!(chunksize > 0, "unexpected zero-sized chunk");

            let copyoff = chunk.offset as u64 + offset;
            let mut copysize = chunksize - offset;
            if num_read as u64 + copysize > size as u64 {
                copysize = size as u64 - num_read as u64;
            }

            ranges.push(
                self.cache
                    .get(chunk.block as usize, copyoff as usize, copysize as usize),
            );
            num_read += copysize as usize;

            if num_read == size || ranges.len() >= maxiov {
                if let Some(entry) = &cache_entry {
                    entry.lock().unwrap().last = Some((it, it_offset, chunksize));
                }
                if self.opts.readahead > 0 {
                    self.do_readahead(inode, chunks, it, read_offset, size, it_offset);
                }
                break;
            }

            offset = 0;
            it_offset += chunksize;
            it += 1;
            if let Some(entry) = &cache_entry {
                if it % OFFSET_CACHE_CHUNK_INDEX_INTERVAL == 0 && it < chunks.len() {
                    entry.lock().unwrap().record(it, it_offset);
                }
            }
        }

        Ok(ranges)
    }

    fn do_readahead(
        &self,
        inode: u32,
        chunks: &[Chunk],
        mut it: usize,
        read_offset: u64,
        size: usize,
        mut it_offset: u64,
    ) {
        let current_offset = read_offset + size as u64;
        let readahead_until = current_offset + self.opts.readahead;
        let mut readahead_pos = 0u64;

        {
            let mut ra = self.readahead_cache.lock().unwrap();
            if read_offset > 0 {
                if let Some(&pos) = ra.peek(&inode) {
                    readahead_pos = pos;
                }
                if readahead_until <= readahead_pos {
                    return; // already prefetched past this point
                }
            }
            ra.insert(inode, readahead_until);
        }

        while it < chunks.len() {
            let c = chunks[it];
            if it_offset + u64::from(c.size) >= readahead_pos {
                // fire-and-forget; errors are hints only
                drop(self.cache.get(c.block as usize, c.offset as usize, c.size as usize));
            }
            it_offset += u64::from(c.size);
            if it_offset >= readahead_until {
                break;
            }
            it += 1;
        }
    }

    // ── Read flavors ─────────────────────────────────────────────────────────

    /// Copy into `buf`, returning the number of bytes read.
    pub fn read_into(
        &self,
        inode: u32,
        buf: &mut [u8],
        offset: i64,
        chunks: &[Chunk],
    ) -> Result<usize> {
        let futures = self.readv_futures(inode, buf.len(), offset, READ_ALL_IOV, chunks)?;
        let mut num_read = 0usize;
        for f in futures {
            match f.wait() {
                Ok(range) => {
                    buf[num_read..num_read + range.size()].copy_from_slice(range.data());
                    num_read += range.size();
                }
                Err(e) => {
                    error!("read of inode {inode} failed: {e}");
                    return Err(e.into());
                }
            }
        }
        Ok(num_read)
    }

    /// Allocate and fill a buffer of up to `size` bytes.
    pub fn read(&self, inode: u32, size: usize, offset: i64, chunks: &[Chunk]) -> Result<Vec<u8>> {
        let futures = self.readv_futures(inode, size, offset, READ_ALL_IOV, chunks)?;
        let mut out = Vec::with_capacity(size.min(64 << 20));
        for f in futures {
            let range = f.wait()?;
            out.extend_from_slice(range.data());
        }
        Ok(out)
    }

    /// Scatter read: zero-copy ranges over cached blocks.
    pub fn readv(
        &self,
        inode: u32,
        size: usize,
        offset: i64,
        maxiov: usize,
        chunks: &[Chunk],
    ) -> Result<IovecReadBuf> {
        let futures = self.readv_futures(inode, size, offset, maxiov, chunks)?;
        let mut buf = IovecReadBuf::default();
        for f in futures {
            buf.ranges.push(f.wait()?);
        }
        Ok(buf)
    }

    /// Dump an inode's chunk list, for diagnostics.
    pub fn dump_chunks(&self, chunks: &[Chunk]) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{i}] -> (block={}, offset={}, size={})",
                c.block, c.offset, c.size
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCacheOptions;
    use crate::codec::Registry;
    use crate::image::ImageData;
    use crate::section::{CompressionType, SectionType, SectionWriter};

    /// A fragmented "file": many small chunks alternating between blocks.
    struct Fixture {
        reader: InodeReader,
        chunks: Vec<Chunk>,
        content: Vec<u8>,
    }

    fn fixture(num_chunks: usize, chunk_size: usize, readahead: u64) -> Fixture {
        let bs = 1 << 16;
        let nblocks = (num_chunks * chunk_size).div_ceil(bs).max(2);
        let reg = Registry::with_builtin();

        let block_data: Vec<Vec<u8>> = (0..nblocks)
            .map(|b| (0..bs).map(|i| ((b * 131 + i * 7) % 253) as u8).collect())
            .collect();

        let mut sw = SectionWriter::new(Vec::new());
        for d in &block_data {
            let payload = reg
                .compress_payload(CompressionType::Zstd, d, 3, None)
                .unwrap();
            sw.write_section(SectionType::Block, CompressionType::Zstd, &payload)
                .unwrap();
        }
        let img = sw.finalize().unwrap();
        let sections: Vec<_> = crate::section::scan_sections(&img)
            .unwrap()
            .into_iter()
            .filter(|s| s.section_type() == Some(SectionType::Block))
            .map(Arc::new)
            .collect();

        let cache = BlockCache::new(
            ImageData::from_vec(img),
            Arc::new(Registry::with_builtin()),
            BlockCacheOptions::default(),
        );
        for s in sections {
            cache.insert(s);
        }
        cache.set_block_size(bs).unwrap();

        // chunks walk the blocks round-robin
        let mut chunks = Vec::new();
        let mut content = Vec::new();
        for i in 0..num_chunks {
            let block = i % nblocks;
            let offset = (i / nblocks) * chunk_size;
            chunks.push(Chunk {
                block: block as u32,
                offset: offset as u32,
                size: chunk_size as u32,
            });
            content.extend_from_slice(&block_data[block][offset..offset + chunk_size]);
        }

        Fixture {
            reader: InodeReader::new(cache, InodeReaderOptions { readahead }),
            chunks,
            content,
        }
    }

    #[test]
    fn sequential_and_random_reads_match_content() {
        let f = fixture(300, 100, 0);
        let total = f.content.len();

        // sequential in 997-byte steps
        let mut pos = 0usize;
        while pos < total {
            let want = 997.min(total - pos);
            let got = f.reader.read(1, want, pos as i64, &f.chunks).unwrap();
            assert_eq!(got, &f.content[pos..pos + want]);
            pos += want;
        }

        // random offsets
        for &(off, len) in &[(0usize, 1usize), (12345, 2048), (total - 5, 5), (total / 2, 9999)] {
            let len = len.min(total - off);
            let got = f.reader.read(1, len, off as i64, &f.chunks).unwrap();
            assert_eq!(got, &f.content[off..off + len], "offset {off}");
        }
    }

    #[test]
    fn eof_and_negative_offsets() {
        let f = fixture(8, 64, 0);
        let total = f.content.len() as i64;

        assert!(f.reader.read(1, 10, -1, &f.chunks).is_err());
        assert!(f.reader.read(1, 10, total, &f.chunks).unwrap().is_empty());
        assert!(f.reader.read(1, 10, total + 100, &f.chunks).unwrap().is_empty());
        assert!(f.reader.read(1, 0, 0, &f.chunks).unwrap().is_empty());

        // short read at EOF
        let got = f.reader.read(1, 1000, total - 10, &f.chunks).unwrap();
        assert_eq!(got.len(), 10);
    }

    #[test]
    fn maxiov_limits_ranges() {
        let f = fixture(32, 64, 0);
        let buf = f.reader.readv(1, 1024, 0, 4, &f.chunks).unwrap();
        assert_eq!(buf.ranges.len(), 4);
        assert_eq!(buf.total_size(), 4 * 64);
        let mut collected = Vec::new();
        for r in &buf.ranges {
            collected.extend_from_slice(r.data());
        }
        assert_eq!(collected, &f.content[..256]);
    }

    #[test]
    fn offset_cache_kicks_in_for_fragmented_files() {
        let f = fixture(600, 32, 0);
        let total = f.content.len();

        // prime the cache with a sequential pass
        let mut pos = 0;
        while pos < total {
            let want = 4096.min(total - pos);
            let got = f.reader.read(42, want, pos as i64, &f.chunks).unwrap();
            assert_eq!(got, &f.content[pos..pos + want]);
            pos += want;
        }
        // the per-inode entry now has interval offsets recorded
        let entry = f
            .reader
            .offset_cache
            .lock()
            .unwrap()
            .peek(&42)
            .cloned()
            .expect("offset cache entry");
        assert!(!entry.lock().unwrap().offsets.is_empty());

        // random access through the cached offsets still yields the truth
        for &off in &[19_000usize, 10_000, 1_000, total - 33] {
            let got = f.reader.read(42, 33, off as i64, &f.chunks).unwrap();
            assert_eq!(got, &f.content[off..(off + 33).min(total)]);
        }
    }

    #[test]
    fn readahead_prefetches_following_chunks() {
        let f = fixture(64, 512, 16 * 1024);
        let got = f.reader.read(7, 1024, 0, &f.chunks).unwrap();
        assert_eq!(got, &f.content[..1024]);

        // the readahead position was recorded
        let pos = *f
            .reader
            .readahead_cache
            .lock()
            .unwrap()
            .peek(&7)
            .expect("readahead entry");
        assert_eq!(pos, 1024 + 16 * 1024);
    }
}
