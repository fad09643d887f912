//! Filesystem reader façade.
//!
//! [`Filesystem`] ties the section container, the frozen metadata view,
//! the block cache, and the inode reader into the public read API:
//! `check`, `find`, `getattr`, `readlink`, `opendir`/`readdir`, `open`,
//! `read`/`readv`, `statvfs`, `walk`, plus JSON/dump introspection and
//! runtime knobs for the cache.
//!
//! Opening an image resolves the section index (or falls back to a forward
//! scan), verifies and loads the metadata pair, and registers every BLOCK
//! section with the cache.  A corrupt `HISTORY` section is tolerated; a
//! corrupt metadata section is not.

use std::path::Path;
use std::sync::Arc;

use log::warn;
use serde_json::json;

use crate::cache::{BlockCache, BlockCacheOptions, BlockRange, CacheTidyConfig};
use crate::codec::{PayloadRef, Registry};
use crate::error::{DwarfsError, Result};
use crate::history::History;
use crate::image::ImageData;
use crate::inode_reader::{InodeReader, InodeReaderOptions, IovecReadBuf, READ_ALL_IOV};
use crate::metadata::{FileStat, InodeView, Metadata, MetadataView, WalkEntry};
use crate::oneshot::BlockFuture;
use crate::section::{load_sections_from, Section, SectionType, VerifyLevel};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FilesystemOptions {
    pub block_cache: BlockCacheOptions,
    pub inode_reader: InodeReaderOptions,
    /// Run the full metadata invariant sweep at open time.
    pub check_metadata_consistency: bool,
    /// Length of an opaque header preceding the first section.
    pub image_offset: usize,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        Self {
            block_cache: BlockCacheOptions::default(),
            inode_reader: InodeReaderOptions::default(),
            check_metadata_consistency: true,
            image_offset: 0,
        }
    }
}

/// `statvfs(2)`-shaped filesystem summary.  Images are always read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatVfs {
    pub block_size: u32,
    pub total_fs_size: u64,
    pub inode_count: u32,
    pub read_only: bool,
}

// ── Filesystem ───────────────────────────────────────────────────────────────

pub struct Filesystem {
    image: Arc<ImageData>,
    image_offset: usize,
    sections: Vec<Arc<Section>>,
    meta: Arc<MetadataView>,
    reader: InodeReader,
    registry: Arc<Registry>,
    history: Option<History>,
}

impl Filesystem {
    pub fn open<P: AsRef<Path>>(path: P, options: FilesystemOptions) -> Result<Self> {
        let image = ImageData::open(path)?;
        Self::from_image(image, options)
    }

    pub fn from_image(image: Arc<ImageData>, options: FilesystemOptions) -> Result<Self> {
        Self::with_registry(image, options, Arc::new(Registry::with_builtin()))
    }

    pub fn with_registry(
        image: Arc<ImageData>,
        options: FilesystemOptions,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let sections: Vec<Arc<Section>> =
            load_sections_from(image.as_slice(), options.image_offset)?
                .into_iter()
                .map(Arc::new)
                .collect();

        let metadata = Self::load_metadata(&image, &sections, &registry)?;
        let meta = Arc::new(MetadataView::new(
            metadata,
            options.check_metadata_consistency,
        )?);

        let cache = BlockCache::new(
            Arc::clone(&image),
            Arc::clone(&registry),
            options.block_cache.clone(),
        );
        for s in &sections {
            if s.section_type() == Some(SectionType::Block) {
                cache.insert(Arc::clone(s));
            }
        }
        cache.set_block_size(meta.block_size() as usize)?;

        let history = Self::load_history(&image, &sections, &registry);

        Ok(Filesystem {
            image,
            image_offset: options.image_offset,
            sections,
            meta,
            reader: InodeReader::new(cache, options.inode_reader),
            registry,
            history,
        })
    }

    fn load_metadata(
        image: &Arc<ImageData>,
        sections: &[Arc<Section>],
        registry: &Registry,
    ) -> Result<Metadata> {
        let find = |ty: SectionType| -> Result<&Arc<Section>> {
            sections
                .iter()
                .find(|s| s.section_type() == Some(ty))
                .ok_or_else(|| {
                    DwarfsError::InvalidArgument(format!("image has no {} section", ty.name()))
                })
        };
        let schema_sec = find(SectionType::MetadataV2Schema)?;
        let meta_sec = find(SectionType::MetadataV2)?;

        // metadata integrity is non-negotiable
        schema_sec.verify(image.as_slice(), VerifyLevel::Checksum)?;
        meta_sec.verify(image.as_slice(), VerifyLevel::Checksum)?;

        let load = |sec: &Arc<Section>| -> Result<Vec<u8>> {
            let payload = PayloadRef::new(Arc::clone(image), sec.start(), sec.length() as usize);
            Ok(registry.decompress_payload(sec.checked_compression()?, payload)?)
        };
        let schema_bytes = load(schema_sec)?;
        let table_bytes = load(meta_sec)?;

        Ok(Metadata::from_sections(&schema_bytes, &table_bytes)?)
    }

    fn load_history(
        image: &Arc<ImageData>,
        sections: &[Arc<Section>],
        registry: &Registry,
    ) -> Option<History> {
        let sec = sections
            .iter()
            .find(|s| s.section_type() == Some(SectionType::History))?;
        // history is non-essential: a corrupt section is dropped, not fatal
        if sec.verify(image.as_slice(), VerifyLevel::Checksum).is_err() {
            warn!("ignoring HISTORY section with bad checksum");
            return None;
        }
        let payload = PayloadRef::new(Arc::clone(image), sec.start(), sec.length() as usize);
        let bytes = registry
            .decompress_payload(sec.checked_compression().ok()?, payload)
            .ok()?;
        History::parse(&bytes)
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn metadata(&self) -> &MetadataView {
        &self.meta
    }

    pub fn sections(&self) -> &[Arc<Section>] {
        &self.sections
    }

    pub fn image(&self) -> &Arc<ImageData> {
        &self.image
    }

    pub fn image_offset(&self) -> usize {
        self.image_offset
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    pub fn num_blocks(&self) -> usize {
        self.reader.num_blocks()
    }

    pub fn cache_stats(&self) -> crate::cache::BlockCacheStats {
        self.reader.cache().stats()
    }

    /// The category name of a block, if the image records categories.
    pub fn block_category(&self, block_no: usize) -> Option<&str> {
        let md = self.meta.metadata();
        let cat = *md.block_categories.get(block_no)? as usize;
        md.category_names.get(cat).map(String::as_str)
    }

    pub fn block_category_metadata(&self, block_no: usize) -> Option<&str> {
        let md = self.meta.metadata();
        let idx = *md.block_category_metadata.get(&(block_no as u32))? as usize;
        md.category_metadata_json.get(idx).map(String::as_str)
    }

    // ── check ────────────────────────────────────────────────────────────────

    /// Verify every section at `level` using `num_workers` threads.
    /// Returns the number of failing sections; never fails itself.
    ///
    /// Unknown section and compression types are flagged in the log but do
    /// not count as failures — they only error when accessed.  `Full`
    /// always decompresses, regardless of the cache's
    /// `disable_block_integrity_check`.
    pub fn check(&self, level: VerifyLevel, num_workers: usize) -> usize {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .build();
        let check_one = |sec: &Arc<Section>| -> bool {
            if !sec.is_known_type() || !sec.is_known_compression() {
                warn!("unknown type/compression in section: {}", sec.description());
            }
            if sec.verify(self.image.as_slice(), level).is_err() {
                return false;
            }
            if level == VerifyLevel::Full && sec.section_type() != Some(SectionType::SectionIndex)
            {
                if let Ok(compression) = sec.checked_compression() {
                    let payload = PayloadRef::new(
                        Arc::clone(&self.image),
                        sec.start(),
                        sec.length() as usize,
                    );
                    if self.registry.decompress_payload(compression, payload).is_err() {
                        return false;
                    }
                }
            }
            true
        };

        let run = || {
            use rayon::prelude::*;
            self.sections.par_iter().filter(|s| !check_one(s)).count()
        };
        match pool {
            Ok(pool) => pool.install(run),
            Err(_) => self.sections.iter().filter(|s| !check_one(s)).count(),
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn find(&self, path: &str) -> Option<InodeView<'_>> {
        self.meta.find_path(path)
    }

    pub fn find_inode(&self, inode: u32) -> Result<InodeView<'_>> {
        Ok(self.meta.inode(inode)?)
    }

    pub fn find_at(&self, dir: InodeView<'_>, name: &str) -> Option<InodeView<'_>> {
        self.meta.find_entry(dir, name.as_bytes())
    }

    pub fn root(&self) -> InodeView<'_> {
        self.meta.root()
    }

    // ── Attributes ───────────────────────────────────────────────────────────

    pub fn getattr(&self, iv: InodeView<'_>) -> Result<FileStat> {
        Ok(self.meta.getattr(iv)?)
    }

    pub fn readlink(&self, iv: InodeView<'_>) -> Result<String> {
        if !iv.is_symlink() {
            return Err(DwarfsError::InvalidOperation(format!(
                "inode {} is not a symlink",
                iv.num()
            )));
        }
        let target = self.meta.symlink_target(iv.num())?;
        Ok(String::from_utf8_lossy(target).into_owned())
    }

    // ── Directories ──────────────────────────────────────────────────────────

    /// Validate that `iv` is a directory and return it as a handle.
    pub fn opendir<'a>(&'a self, iv: InodeView<'a>) -> Result<InodeView<'a>> {
        if !iv.is_directory() {
            return Err(DwarfsError::InvalidOperation(format!(
                "inode {} is not a directory",
                iv.num()
            )));
        }
        Ok(iv)
    }

    /// Offsets 0 and 1 are the synthetic `.` and `..`.
    pub fn readdir<'a>(&'a self, dir: InodeView<'a>, offset: usize) -> Option<(InodeView<'a>, String)> {
        self.meta
            .readdir(dir, offset)
            .map(|(iv, name)| (iv, String::from_utf8_lossy(&name).into_owned()))
    }

    pub fn dirsize(&self, dir: InodeView<'_>) -> usize {
        // two synthetic entries plus the real ones
        2 + self.meta.dir_entry_count(dir)
    }

    // ── Files ────────────────────────────────────────────────────────────────

    /// Open a regular file; the handle is just the inode number.
    pub fn open_file(&self, iv: InodeView<'_>) -> Result<u32> {
        if !iv.is_regular() {
            return Err(DwarfsError::InvalidOperation(format!(
                "inode {} is not a regular file",
                iv.num()
            )));
        }
        Ok(iv.num())
    }

    pub fn read(&self, inode: u32, size: usize, offset: i64) -> Result<Vec<u8>> {
        let chunks = self.meta.chunks(inode)?;
        self.reader.read(inode, size, offset, chunks)
    }

    pub fn read_into(&self, inode: u32, buf: &mut [u8], offset: i64) -> Result<usize> {
        let chunks = self.meta.chunks(inode)?;
        self.reader.read_into(inode, buf, offset, chunks)
    }

    pub fn readv(
        &self,
        inode: u32,
        size: usize,
        offset: i64,
        maxiov: usize,
    ) -> Result<IovecReadBuf> {
        let chunks = self.meta.chunks(inode)?;
        self.reader.readv(inode, size, offset, maxiov, chunks)
    }

    /// The futures-returning flavor: one future per chunk range.
    pub fn readv_futures(
        &self,
        inode: u32,
        size: usize,
        offset: i64,
    ) -> Result<Vec<BlockFuture<BlockRange>>> {
        let chunks = self.meta.chunks(inode)?;
        self.reader
            .readv_futures(inode, size, offset, READ_ALL_IOV, chunks)
    }

    // ── Walks & statvfs ──────────────────────────────────────────────────────

    pub fn walk<F: FnMut(&WalkEntry)>(&self, cb: F) {
        self.meta.walk(cb)
    }

    pub fn walk_data_order<F: FnMut(&WalkEntry)>(&self, cb: F) {
        self.meta.walk_data_order(cb)
    }

    pub fn statvfs(&self) -> StatVfs {
        StatVfs {
            block_size: self.meta.block_size(),
            total_fs_size: self.meta.total_fs_size(),
            inode_count: self.meta.inode_count(),
            read_only: true,
        }
    }

    // ── Runtime knobs ────────────────────────────────────────────────────────

    pub fn set_num_workers(&self, num: usize) {
        self.reader.set_num_workers(num);
    }

    pub fn set_cache_tidy_config(&self, cfg: CacheTidyConfig) {
        self.reader.set_cache_tidy_config(cfg);
    }

    // ── Dump / JSON ──────────────────────────────────────────────────────────

    pub fn info_as_json(&self) -> serde_json::Value {
        let md = self.meta.metadata();
        json!({
            "image_offset": self.image_offset,
            "block_size": self.meta.block_size(),
            "total_fs_size": self.meta.total_fs_size(),
            "inode_count": self.meta.inode_count(),
            "block_count": self.num_blocks(),
            "created_by": md.dwarfs_version.clone(),
            "create_timestamp": md.create_timestamp,
            "features": md.features.clone(),
            "categories": md.category_names.clone(),
            "sections": self.sections.iter().map(|s| {
                json!({
                    "number": s.number(),
                    "type": s.name(),
                    "compression": s.compression().map(|c| c.name()),
                    "length": s.length(),
                })
            }).collect::<Vec<_>>(),
            "history": self.history.as_ref().map(|h| h.entries.iter().map(|e| {
                json!({
                    "version": e.version.clone(),
                    "timestamp": e.timestamp,
                    "arguments": e.arguments.clone(),
                })
            }).collect::<Vec<_>>()),
        })
    }

    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "DwarFS image ({} sections)", self.sections.len());
        for s in &self.sections {
            let _ = writeln!(out, "  SECTION {}", s.description());
        }
        self.walk(|e| {
            let iv = self.meta.inode(e.inode_num).expect("walk yields valid inodes");
            let stat = self.meta.getattr(iv).ok();
            let _ = writeln!(
                out,
                "{:indent$}{} [inode {}, mode {:o}, {} B]",
                "",
                if e.path.is_empty() { "/" } else { &e.path },
                e.inode_num,
                stat.as_ref().map(|s| s.mode).unwrap_or(0),
                stat.as_ref().map(|s| s.size).unwrap_or(0),
                indent = e.depth * 2,
            );
        });
        out
    }
}
