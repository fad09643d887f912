//! A single decompressible block with an incrementally growing prefix.
//!
//! # States
//!
//! A cached block moves through `uninitialized → decompressing → ready`;
//! eviction can strike any state except mid-`decompressing` (the worker
//! holds a strong reference while it runs).  Partial readiness is a
//! first-class state: a block whose first 30% is decompressed can satisfy
//! every request whose range lies inside that prefix.
//!
//! # Memory protocol
//!
//! The uncompressed buffer is allocated once with capacity for the full
//! block and never reallocates, so its address is stable.  Exactly one
//! writer (the worker holding the decompressor mutex) appends; the
//! watermark is published with `Release` after each append and consumers
//! read it with `Acquire` before slicing.  Bytes below the watermark are
//! never written again.  This is what makes the `UnsafeCell` sound.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::codec::{Decompressor, PayloadRef, Registry, DEFAULT_FRAME_SIZE};
use crate::error::CacheError;
use crate::image::ImageData;
use crate::section::{Section, VerifyLevel};

struct BlockBuffer {
    data: UnsafeCell<Vec<u8>>,
    watermark: AtomicUsize,
}

// Safety: see the memory protocol above.  Writers are serialized by the
// decompressor mutex; readers only touch bytes below the watermark.
unsafe impl Sync for BlockBuffer {}
unsafe impl Send for BlockBuffer {}

pub struct CachedBlock {
    block_no: usize,
    buffer: BlockBuffer,
    /// `None` once fully decompressed.
    decompressor: Mutex<Option<Box<dyn Decompressor>>>,
    uncompressed_size: usize,
    payload: PayloadRef,
    mm_release: bool,
    /// Milliseconds since the cache epoch; 0 = never touched.
    last_used_ms: AtomicU64,
}

impl CachedBlock {
    /// Build a cached block for a BLOCK section, verifying the section
    /// checksum unless disabled.
    pub fn create(
        block_no: usize,
        section: &Section,
        image: &Arc<ImageData>,
        registry: &Registry,
        disable_integrity_check: bool,
        mm_release: bool,
    ) -> Result<Arc<Self>, CacheError> {
        if !disable_integrity_check {
            section
                .verify(image.as_slice(), VerifyLevel::Checksum)
                .map_err(|_| CacheError::IntegrityCheckFailed(block_no))?;
        }
        let compression = section.checked_compression().map_err(|e| {
            CacheError::BadCompression {
                block_no,
                reason: e.to_string(),
            }
        })?;
        let payload = PayloadRef::new(Arc::clone(image), section.start(), section.length() as usize);
        let decompressor =
            registry
                .decompressor(compression, payload.clone())
                .map_err(|e| CacheError::BadCompression {
                    block_no,
                    reason: e.to_string(),
                })?;
        let uncompressed_size = decompressor.uncompressed_size();

        Ok(Arc::new(CachedBlock {
            block_no,
            buffer: BlockBuffer {
                data: UnsafeCell::new(Vec::with_capacity(uncompressed_size)),
                watermark: AtomicUsize::new(0),
            },
            decompressor: Mutex::new(Some(decompressor)),
            uncompressed_size,
            payload,
            mm_release,
            last_used_ms: AtomicU64::new(0),
        }))
    }

    pub fn block_no(&self) -> usize {
        self.block_no
    }

    pub fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    /// Current length of the decompressed prefix.
    pub fn range_end(&self) -> usize {
        self.buffer.watermark.load(Ordering::Acquire)
    }

    /// Ensure at least `target` bytes are decompressed.  Returns the number
    /// of bytes newly produced.
    ///
    /// Invoked by at most one worker at a time per block (the cache's
    /// `decompressing` registry guarantees it); the mutex makes that safe
    /// even if the invariant were violated.
    pub fn decompress_until(&self, target: usize) -> Result<usize, CacheError> {
        let target = target.min(self.uncompressed_size);
        let mut guard = self.decompressor.lock().unwrap();

        let before = self.range_end();
        if before >= target {
            return Ok(0);
        }
        let Some(dec) = guard.as_mut() else {
            // fully decompressed already
            return Ok(0);
        };

        // Safety: single writer (we hold the decompressor mutex); the Vec
        // never reallocates because capacity covers the full block.
        let data = unsafe { &mut *self.buffer.data.get() };

        let mut done = false;
        while data.len() < target && !done {
            done = dec
                .decompress_frame(data, DEFAULT_FRAME_SIZE)
                .map_err(|e| CacheError::BadCompression {
                    block_no: self.block_no,
                    reason: e.to_string(),
                })?;
            debug_assert!(
                data.len() <= self.uncompressed_size,
                "decompressor produced more than the declared size"
            );
            self.buffer.watermark.store(data.len(), Ordering::Release);
        }

        if done {
            *guard = None;
            if self.mm_release {
                self.payload.release_pages();
            }
        }

        if data.len() < target {
            return Err(CacheError::BadCompression {
                block_no: self.block_no,
                reason: format!(
                    "stream ended at {} of {} bytes",
                    data.len(),
                    self.uncompressed_size
                ),
            });
        }

        Ok(data.len() - before)
    }

    /// Read `size` bytes at `offset`.  The range must lie below the
    /// watermark — the cache only fulfils a request after decompressing
    /// that far.
    pub fn data(&self, offset: usize, size: usize) -> &[u8] {
        let end = offset + size;
        let watermark = self.range_end();
        assert!(
            end <= watermark,
            "read of {offset}..{end} beyond decompressed prefix {watermark}"
        );
        // Safety: bytes below the watermark are immutable and the buffer
        // address is stable.
        unsafe { &(&*self.buffer.data.get())[offset..end] }
    }

    // ── Tidy support ─────────────────────────────────────────────────────────

    pub fn touch(&self, epoch: &Instant) {
        self.last_used_ms
            .store(epoch.elapsed().as_millis() as u64 + 1, Ordering::Relaxed);
    }

    pub fn last_used_before(&self, cutoff_ms: u64) -> bool {
        self.last_used_ms.load(Ordering::Relaxed) < cutoff_ms
    }

    /// Ask the OS whether any resident page of the decompressed prefix has
    /// been reclaimed.  A hint only; errors read as "not swapped out".
    #[cfg(unix)]
    pub fn any_pages_swapped_out(&self, scratch: &mut Vec<u8>) -> bool {
        let len = self.range_end();
        if len == 0 {
            return false;
        }
        // Safety: we only inspect the address range, below the watermark.
        let ptr = unsafe { (*self.buffer.data.get()).as_ptr() };
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if page == 0 {
            return false;
        }
        let addr = ptr as usize & !(page - 1);
        let span = (ptr as usize + len) - addr;
        let pages = span.div_ceil(page);
        scratch.resize(pages, 0);
        let rc = unsafe {
            libc::mincore(
                addr as *mut libc::c_void,
                span,
                scratch.as_mut_ptr() as *mut _,
            )
        };
        rc == 0 && scratch.iter().any(|&b| b & 1 == 0)
    }

    #[cfg(not(unix))]
    pub fn any_pages_swapped_out(&self, _scratch: &mut Vec<u8>) -> bool {
        false
    }
}

impl std::fmt::Debug for CachedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CachedBlock({}: {}/{} B)",
            self.block_no,
            self.range_end(),
            self.uncompressed_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{CompressionType, SectionType, SectionWriter};

    fn one_block_image(data: &[u8]) -> (Arc<ImageData>, Section) {
        let reg = Registry::with_builtin();
        let payload = reg
            .compress_payload(CompressionType::Zstd, data, 3, None)
            .unwrap();
        let mut sw = SectionWriter::new(Vec::new());
        sw.write_section(SectionType::Block, CompressionType::Zstd, &payload)
            .unwrap();
        let img = sw.finalize().unwrap();
        let section = Section::parse_at(&img, 0).unwrap();
        (ImageData::from_vec(img), section)
    }

    fn test_data() -> Vec<u8> {
        (0u32..100_000).flat_map(|i| (i % 251).to_le_bytes()).collect()
    }

    #[test]
    fn incremental_prefix_growth() {
        let data = test_data();
        let (image, section) = one_block_image(&data);
        let reg = Registry::with_builtin();
        let block = CachedBlock::create(0, &section, &image, &reg, false, false).unwrap();

        assert_eq!(block.uncompressed_size(), data.len());
        assert_eq!(block.range_end(), 0);

        block.decompress_until(1000).unwrap();
        let end1 = block.range_end();
        assert!(end1 >= 1000 && end1 < data.len());
        assert_eq!(block.data(0, 1000), &data[..1000]);

        // no-op when already covered
        assert_eq!(block.decompress_until(end1).unwrap(), 0);

        block.decompress_until(data.len()).unwrap();
        assert_eq!(block.range_end(), data.len());
        assert_eq!(block.data(0, data.len()), &data[..]);
    }

    #[test]
    fn repeated_decompression_is_deterministic() {
        let data = test_data();
        let (image, section) = one_block_image(&data);
        let reg = Registry::with_builtin();

        let a = CachedBlock::create(0, &section, &image, &reg, false, false).unwrap();
        let b = CachedBlock::create(0, &section, &image, &reg, false, false).unwrap();
        a.decompress_until(data.len()).unwrap();
        b.decompress_until(data.len()).unwrap();
        assert_eq!(a.data(0, data.len()), b.data(0, data.len()));
    }

    #[test]
    fn corrupt_section_fails_integrity() {
        let data = test_data();
        let (image, _) = one_block_image(&data);
        let mut raw = image.as_slice().to_vec();
        let section = Section::parse_at(&raw, 0).unwrap();
        let victim = section.start() + 5;
        raw[victim] ^= 0xFF;
        let image = ImageData::from_vec(raw);
        let section = Section::parse_at(image.as_slice(), 0).unwrap();
        let reg = Registry::with_builtin();
        let err = CachedBlock::create(0, &section, &image, &reg, false, false).unwrap_err();
        assert!(matches!(err, CacheError::IntegrityCheckFailed(0)));
    }

    #[test]
    #[should_panic(expected = "beyond decompressed prefix")]
    fn read_beyond_watermark_panics() {
        let data = test_data();
        let (image, section) = one_block_image(&data);
        let reg = Registry::with_builtin();
        let block = CachedBlock::create(0, &section, &image, &reg, false, false).unwrap();
        block.decompress_until(64).unwrap();
        let end = block.range_end();
        block.data(end, 1);
    }
}
