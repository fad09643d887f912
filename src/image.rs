//! Read-only byte sources: memory-mapped files and owned buffers.
//!
//! Everything that parses an image (or hashes a source file) works on a
//! [`ImageData`], so tests can run entirely in memory while production code
//! maps files with `memmap2`.  The OS mapping itself is a collaborator; this
//! module only wraps the result behind one deref-to-`[u8]` type.

use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

/// A contiguous, immutable byte source.
pub enum ImageData {
    /// Owned in-memory bytes (tests, rewrite staging).
    Bytes(Vec<u8>),
    /// A read-only file mapping.
    Mapped(memmap2::Mmap),
}

impl ImageData {
    /// Map `path` read-only.  Empty files yield an empty `Bytes` variant,
    /// since mapping zero bytes is not portable.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Arc<Self>> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Arc::new(ImageData::Bytes(Vec::new())));
        }
        // Safety: the mapping is read-only and we never hand out &mut.
        // Concurrent truncation of the underlying file is outside our
        // contract, as with any mmap consumer.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Arc::new(ImageData::Mapped(map)))
    }

    pub fn from_vec(data: Vec<u8>) -> Arc<Self> {
        Arc::new(ImageData::Bytes(data))
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ImageData::Bytes(v) => v.as_slice(),
            ImageData::Mapped(m) => m.deref(),
        }
    }

    /// Advise the OS that `range` will not be needed again soon.
    /// Purely a hint; failures are ignored.
    pub fn release_range(&self, offset: usize, len: usize) {
        #[cfg(unix)]
        if let ImageData::Mapped(m) = self {
            let _ = unsafe {
                m.unchecked_advise_range(memmap2::UncheckedAdvice::DontNeed, offset, len)
            };
        }
        #[cfg(not(unix))]
        {
            let _ = (offset, len);
        }
    }
}

impl Deref for ImageData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageData::Bytes(v) => write!(f, "ImageData::Bytes({} B)", v.len()),
            ImageData::Mapped(m) => write!(f, "ImageData::Mapped({} B)", m.len()),
        }
    }
}

/// A mapped view of a source file, handed out by the OS access collaborator.
pub type FileView = Arc<ImageData>;
