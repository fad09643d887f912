//! Filesystem writer — scans a source tree and emits a complete image.
//!
//! Pipeline: the tree walk feeds regular files to the [`FileScanner`];
//! after finalization every content object is categorized (an external
//! concern — the default tags everything `<default>`), its data is packed
//! into per-category blocks honoring the codec's granularity constraints,
//! and the blocks are compressed by one producer thread per category.
//! Producers feed the [`MultiQueueBlockMerger`], whose emission order —
//! and therefore the physical block numbering and the final image bytes —
//! depends only on the category order, never on thread timing.
//!
//! After the last data block the writer emits the metadata schema and
//! metadata sections, an optional history section, and the section index.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};

use log::{debug, info};
use serde_json::Value;

use crate::checksum::HashAlgorithm;
use crate::codec::Registry;
use crate::error::{DwarfsError, Result};
use crate::history::History;
use crate::merger::MultiQueueBlockMerger;
use crate::metadata::{
    BuilderEntry, BuilderEntryKind, Chunk, MetadataBuilder, MetadataBuilderOptions,
};
use crate::os::{HostFileType, HostStat, OsAccess};
use crate::scanner::{FileScanner, Progress, ScanFile, ScanInode};
use crate::section::{CompressionType, SectionType, SectionWriter};
use crate::worker::WorkerGroup;

/// Category used when no categorizer is installed (or for leftovers).
pub const DEFAULT_CATEGORY: &str = "<default>";

// ── Categorizer contract ─────────────────────────────────────────────────────

/// Tags contiguous file fragments with a category.  The fragment lengths
/// of a file must sum to its size; the core only consumes the output.
pub trait Categorizer: Send + Sync {
    fn categorize(&self, path: &Path, data: &[u8]) -> Vec<(String, u64)>;

    /// Per-category metadata handed to the category's codec.
    fn category_metadata(&self, _category: &str) -> Option<Value> {
        None
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WriterOptions {
    /// Power of two.
    pub block_size: u32,
    pub compression: CompressionType,
    pub compression_level: i32,
    /// Overrides per category name.
    pub category_compression: HashMap<String, (CompressionType, i32)>,
    /// Producer/hasher thread count (0 = one per CPU).
    pub num_workers: usize,
    /// In-flight budget of the block merger.
    pub max_queued_blocks: usize,
    pub hash_algo: HashAlgorithm,
    pub metadata: MetadataBuilderOptions,
    pub enable_history: bool,
    pub history_arguments: Vec<String>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: 1 << 24,
            compression: CompressionType::Zstd,
            compression_level: 3,
            category_compression: HashMap::new(),
            num_workers: 0,
            max_queued_blocks: 16,
            hash_algo: HashAlgorithm::default(),
            metadata: MetadataBuilderOptions::default(),
            enable_history: true,
            history_arguments: Vec::new(),
        }
    }
}

/// Summary returned by a successful write.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub num_blocks: usize,
    pub num_sections: u32,
    pub image_bytes: u64,
    pub files_scanned: u64,
    pub duplicate_files: u64,
    pub saved_by_deduplication: u64,
    pub hardlinks: u64,
    pub errors: u64,
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct FilesystemWriter {
    options: WriterOptions,
    registry: Arc<Registry>,
    categorizer: Option<Box<dyn Categorizer>>,
}

impl FilesystemWriter {
    pub fn new(options: WriterOptions) -> Result<Self> {
        Self::with_registry(options, Arc::new(Registry::with_builtin()))
    }

    pub fn with_registry(options: WriterOptions, registry: Arc<Registry>) -> Result<Self> {
        if !options.block_size.is_power_of_two() {
            return Err(DwarfsError::InvalidArgument(format!(
                "block size {} is not a power of two",
                options.block_size
            )));
        }
        Ok(Self {
            options,
            registry,
            categorizer: None,
        })
    }

    pub fn set_categorizer(&mut self, categorizer: Box<dyn Categorizer>) {
        self.categorizer = Some(categorizer);
    }

    /// Scan `root` and write a complete image to `out`.
    pub fn write_image<W: Write>(
        &self,
        os: &Arc<dyn OsAccess>,
        root: &Path,
        out: W,
    ) -> Result<WriteReport> {
        // ── Phase 1: tree walk + dedup scan ─────────────────────────────────
        let progress = Arc::new(Progress::default());
        let wg = Arc::new(WorkerGroup::new("scanner", self.options.num_workers));
        let mut scanner = FileScanner::new(
            Arc::clone(&wg),
            Arc::clone(os),
            Arc::clone(&progress),
            self.options.hash_algo,
        );

        let root_stat = os.stat(root)?;
        if root_stat.file_type != HostFileType::Directory {
            return Err(DwarfsError::InvalidArgument(format!(
                "source root {} is not a directory",
                root.display()
            )));
        }
        let tree = self.walk_tree(os, root, Vec::new(), root_stat, &mut scanner)?;
        let scan = scanner.finalize();
        debug!(
            "scanned {} files, {} content objects",
            progress.files_scanned.load(Ordering::Relaxed),
            scan.inodes.len()
        );

        // ── Phase 2: categorize + fill blocks ───────────────────────────────
        let mut filler = BlockFiller::new(
            &self.options,
            &self.registry,
            self.categorizer.as_deref(),
            os,
        );
        for inode in &scan.inodes {
            filler.add_inode(inode)?;
        }
        let filled = filler.finish()?;

        // ── Phase 3: compress through the merger, emit sections ─────────────
        let mut section_writer = SectionWriter::new(CountingWriter::new(out));
        let block_map = self.compress_and_emit(&filled, &mut section_writer)?;

        // ── Phase 4: metadata + history + index ─────────────────────────────
        let mut builder = MetadataBuilder::new(self.options.metadata.clone());
        builder.set_block_size(self.options.block_size);
        builder.set_root(build_entry_tree(&tree));
        for (object, pending) in filled.object_chunks.iter().enumerate() {
            let chunks = pending
                .iter()
                .map(|p| Chunk {
                    block: block_map[&(p.category, p.cat_block_index)],
                    offset: p.offset,
                    size: p.size,
                })
                .collect();
            builder.set_chunk_list(object as u32, chunks);
        }

        if self.categorizer.is_some() {
            let mut block_categories = vec![0u32; block_map.len()];
            for (&(cat, _), &phys) in &block_map {
                block_categories[phys as usize] = cat;
            }
            let mut metadata_json = Vec::new();
            let mut block_md = std::collections::BTreeMap::new();
            for (cat, name) in filled.category_names.iter().enumerate() {
                let md = self
                    .categorizer
                    .as_ref()
                    .and_then(|c| c.category_metadata(name));
                if let Some(md) = md {
                    let idx = metadata_json.len() as u32;
                    metadata_json.push(md.to_string());
                    for (&(c, _), &phys) in &block_map {
                        if c as usize == cat {
                            block_md.insert(phys, idx);
                        }
                    }
                }
            }
            builder.set_categories(
                filled.category_names.clone(),
                block_categories,
                metadata_json,
                block_md,
            );
        }

        let metadata = builder.build()?;
        let (schema_bytes, table_bytes) = metadata.to_sections()?;

        let meta_compression = self.options.compression;
        let schema_payload = self.registry.compress_payload(
            meta_compression,
            &schema_bytes,
            self.options.compression_level,
            None,
        )?;
        section_writer.write_section(
            SectionType::MetadataV2Schema,
            meta_compression,
            &schema_payload,
        )?;
        let table_payload = self.registry.compress_payload(
            meta_compression,
            &table_bytes,
            self.options.compression_level,
            None,
        )?;
        section_writer.write_section(SectionType::MetadataV2, meta_compression, &table_payload)?;

        if self.options.enable_history {
            let mut history = History::default();
            history.append_now(self.options.history_arguments.clone());
            section_writer.write_section(
                SectionType::History,
                CompressionType::None,
                &history.to_bytes(),
            )?;
        }

        let num_sections = section_writer.next_section_number() + 1;
        let mut out = section_writer.finalize()?;
        out.flush()?;
        let image_bytes = out.bytes_written;

        info!(
            "wrote image: {} blocks, {} sections, {image_bytes} bytes",
            block_map.len(),
            num_sections
        );

        Ok(WriteReport {
            num_blocks: block_map.len(),
            num_sections,
            image_bytes,
            files_scanned: progress.files_scanned.load(Ordering::Relaxed),
            duplicate_files: progress.duplicate_files.load(Ordering::Relaxed),
            saved_by_deduplication: progress.saved_by_deduplication.load(Ordering::Relaxed),
            hardlinks: progress.hardlinks.load(Ordering::Relaxed),
            errors: progress.errors.load(Ordering::Relaxed),
        })
    }

    fn walk_tree(
        &self,
        os: &Arc<dyn OsAccess>,
        path: &Path,
        name: Vec<u8>,
        stat: HostStat,
        scanner: &mut FileScanner,
    ) -> Result<TreeNode> {
        let mut children = Vec::new();
        for child_name in os.read_dir(path)? {
            let child_path = path.join(&child_name);
            let child_stat = os.stat(&child_path)?;
            let name_bytes = child_name.as_encoded_bytes().to_vec();
            let node = match child_stat.file_type {
                HostFileType::Directory => {
                    self.walk_tree(os, &child_path, name_bytes, child_stat, scanner)?
                }
                HostFileType::Regular => {
                    let file = ScanFile::new(child_path.clone(), child_stat);
                    scanner.scan(&file);
                    TreeNode {
                        name: name_bytes,
                        stat: child_stat,
                        kind: TreeNodeKind::File(file),
                    }
                }
                HostFileType::Symlink => {
                    let target = os.read_link(&child_path)?;
                    TreeNode {
                        name: name_bytes,
                        stat: child_stat,
                        kind: TreeNodeKind::Symlink(
                            target.as_os_str().as_encoded_bytes().to_vec(),
                        ),
                    }
                }
                HostFileType::Device => TreeNode {
                    name: name_bytes,
                    stat: child_stat,
                    kind: TreeNodeKind::Device,
                },
                HostFileType::Other => TreeNode {
                    name: name_bytes,
                    stat: child_stat,
                    kind: TreeNodeKind::Other,
                },
            };
            children.push(node);
        }
        Ok(TreeNode {
            name,
            stat,
            kind: TreeNodeKind::Dir(children),
        })
    }

    /// Run one producer thread per category, merge deterministically, and
    /// write BLOCK sections in emission order.  Returns the mapping from
    /// `(category, per-category index)` to physical block number.
    fn compress_and_emit<W: Write>(
        &self,
        filled: &FilledBlocks,
        section_writer: &mut SectionWriter<W>,
    ) -> Result<HashMap<(u32, u32), u32>> {
        let mut block_map = HashMap::new();
        let num_categories = filled.category_names.len();
        if num_categories == 0 {
            return Ok(block_map);
        }

        let total_blocks: usize = filled.raw_blocks.iter().map(Vec::len).sum();
        let sources: Vec<u32> = (0..num_categories as u32).collect();
        let workers = if self.options.num_workers == 0 {
            num_cpus::get()
        } else {
            self.options.num_workers
        };
        let num_active_slots = workers.clamp(1, num_categories);

        // Emitted holders travel to the writing loop; dropping one there
        // (after its section is written) returns its merger credit, so at
        // most `max_queued_blocks` compressed blocks exist at any time.
        let (tx, rx) = mpsc::channel::<crate::merger::MergedBlockHolder<CompressedBlock>>();
        let merger = Arc::new(MultiQueueBlockMerger::new(
            num_active_slots,
            self.options.max_queued_blocks,
            &sources,
            Box::new(move |holder| {
                let _ = tx.send(holder);
            }),
        ));

        std::thread::scope(|scope| -> Result<()> {
            for (cat, blocks) in filled.raw_blocks.iter().enumerate() {
                let merger = Arc::clone(&merger);
                let registry = Arc::clone(&self.registry);
                let (compression, level) = self.block_compression(&filled.category_names[cat]);
                let metadata = filled.category_metadata[cat].clone();
                scope.spawn(move || {
                    let num = blocks.len();
                    for (i, raw) in blocks.iter().enumerate() {
                        // Compression failures flow through the merger so
                        // the pipeline always drains deterministically.
                        let payload = registry
                            .compress_payload(compression, raw, level, metadata.as_ref())
                            .map_err(|e| e.to_string());
                        let size = raw.len();
                        merger.add(
                            cat as u32,
                            CompressedBlock {
                                category: cat as u32,
                                cat_block_index: i as u32,
                                compression,
                                payload,
                            },
                            size,
                            i + 1 == num,
                        );
                    }
                });
            }

            // Write sections in merge order on this thread.  On failure the
            // receiver is dropped first, which fails all further emission
            // callbacks and lets every producer drain and exit.
            let mut result: Result<()> = Ok(());
            for _ in 0..total_blocks {
                let step = rx
                    .recv()
                    .map_err(|_| {
                        DwarfsError::InvalidArgument("block compression pipeline failed".into())
                    })
                    .and_then(|mut holder| {
                        let block = holder.take();
                        let payload = block.payload.map_err(|e| {
                            DwarfsError::InvalidArgument(format!("block compression failed: {e}"))
                        })?;
                        let info = section_writer.write_section(
                            SectionType::Block,
                            block.compression,
                            &payload,
                        )?;
                        block_map.insert((block.category, block.cat_block_index), info.number);
                        Ok(())
                    });
                if let Err(e) = step {
                    result = Err(e);
                    break;
                }
            }
            drop(rx);
            result
        })?;

        debug_assert!(merger.is_drained());
        Ok(block_map)
    }

    fn block_compression(&self, category: &str) -> (CompressionType, i32) {
        self.options
            .category_compression
            .get(category)
            .copied()
            .unwrap_or((self.options.compression, self.options.compression_level))
    }
}

struct CompressedBlock {
    category: u32,
    cat_block_index: u32,
    compression: CompressionType,
    payload: std::result::Result<Vec<u8>, String>,
}

/// Counts bytes on their way to the sink so the report can state the
/// final image size.
struct CountingWriter<W: Write> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

// ── Tree mirror ──────────────────────────────────────────────────────────────

struct TreeNode {
    name: Vec<u8>,
    stat: HostStat,
    kind: TreeNodeKind,
}

enum TreeNodeKind {
    Dir(Vec<TreeNode>),
    File(Arc<ScanFile>),
    Symlink(Vec<u8>),
    Device,
    Other,
}

fn build_entry_tree(node: &TreeNode) -> BuilderEntry {
    let kind = match &node.kind {
        TreeNodeKind::Dir(children) => BuilderEntryKind::Directory {
            children: children.iter().map(build_entry_tree).collect(),
        },
        TreeNodeKind::File(file) => {
            let num = file.inode_num().expect("scan finalized");
            BuilderEntryKind::File {
                regular_index: num,
                object: num,
            }
        }
        TreeNodeKind::Symlink(target) => BuilderEntryKind::Symlink {
            target: target.clone(),
        },
        TreeNodeKind::Device => BuilderEntryKind::Device {
            rdev: node.stat.rdev,
        },
        TreeNodeKind::Other => BuilderEntryKind::Other,
    };
    BuilderEntry {
        name: node.name.clone(),
        kind,
        mode: node.stat.mode,
        uid: node.stat.uid,
        gid: node.stat.gid,
        atime: node.stat.atime,
        mtime: node.stat.mtime,
        ctime: node.stat.ctime,
    }
}

// ── Block filling ────────────────────────────────────────────────────────────

/// A chunk recorded against a not-yet-numbered block.
struct PendingChunk {
    category: u32,
    cat_block_index: u32,
    offset: u32,
    size: u32,
}

struct OpenBlock {
    index: u32,
    data: Vec<u8>,
}

struct FilledBlocks {
    category_names: Vec<String>,
    category_metadata: Vec<Option<Value>>,
    /// raw (uncompressed) blocks per category, in stream order
    raw_blocks: Vec<Vec<Vec<u8>>>,
    /// chunk list per content object
    object_chunks: Vec<Vec<PendingChunk>>,
}

struct BlockFiller<'a> {
    options: &'a WriterOptions,
    registry: &'a Registry,
    categorizer: Option<&'a dyn Categorizer>,
    os: &'a Arc<dyn OsAccess>,
    category_ids: HashMap<String, u32>,
    category_names: Vec<String>,
    category_metadata: Vec<Option<Value>>,
    usable_block_size: Vec<usize>,
    open_blocks: Vec<Option<OpenBlock>>,
    raw_blocks: Vec<Vec<Vec<u8>>>,
    object_chunks: Vec<Vec<PendingChunk>>,
}

impl<'a> BlockFiller<'a> {
    fn new(
        options: &'a WriterOptions,
        registry: &'a Registry,
        categorizer: Option<&'a dyn Categorizer>,
        os: &'a Arc<dyn OsAccess>,
    ) -> Self {
        Self {
            options,
            registry,
            categorizer,
            os,
            category_ids: HashMap::new(),
            category_names: Vec::new(),
            category_metadata: Vec::new(),
            usable_block_size: Vec::new(),
            open_blocks: Vec::new(),
            raw_blocks: Vec::new(),
            object_chunks: Vec::new(),
        }
    }

    fn category_id(&mut self, name: &str) -> Result<u32> {
        if let Some(&id) = self.category_ids.get(name) {
            return Ok(id);
        }
        let id = self.category_names.len() as u32;
        let metadata = self.categorizer.and_then(|c| c.category_metadata(name));
        let (compression, _) = self
            .options
            .category_compression
            .get(name)
            .copied()
            .unwrap_or((self.options.compression, self.options.compression_level));
        // Granularity decides the usable block size for this category.
        let constraints = self
            .registry
            .compression_constraints(compression, metadata.as_ref())?;
        let usable = constraints.clamp_block_size(self.options.block_size as usize);

        self.category_ids.insert(name.to_string(), id);
        self.category_names.push(name.to_string());
        self.category_metadata.push(metadata);
        self.usable_block_size.push(usable);
        self.open_blocks.push(None);
        self.raw_blocks.push(Vec::new());
        Ok(id)
    }

    fn add_inode(&mut self, inode: &Arc<ScanInode>) -> Result<()> {
        let object = inode.num().expect("finalized inode") as usize;
        if self.object_chunks.len() <= object {
            self.object_chunks.resize_with(object + 1, Vec::new);
        }

        let files = inode.files();
        let source = files.first().expect("inode without files");
        if source.is_invalid() || source.size() == 0 {
            return Ok(()); // empty chunk list
        }

        let view = self.os.map_file(&source.path)?;
        let data = view.as_slice();

        let fragments = match self.categorizer {
            Some(c) => {
                let frags = c.categorize(&source.path, data);
                let total: u64 = frags.iter().map(|(_, l)| l).sum();
                if total != data.len() as u64 {
                    return Err(DwarfsError::InvalidArgument(format!(
                        "categorizer fragments sum to {total}, file has {} bytes",
                        data.len()
                    )));
                }
                frags
            }
            None => vec![(DEFAULT_CATEGORY.to_string(), data.len() as u64)],
        };

        let mut pos = 0usize;
        for (category, len) in fragments {
            if len == 0 {
                continue; // a category with no data would never close its stream
            }
            let cat = self.category_id(&category)?;
            self.append_fragment(object, cat, &data[pos..pos + len as usize]);
            pos += len as usize;
        }
        Ok(())
    }

    fn append_fragment(&mut self, object: usize, cat: u32, mut data: &[u8]) {
        let usable = self.usable_block_size[cat as usize];
        while !data.is_empty() {
            let open = self.open_blocks[cat as usize].get_or_insert_with(|| OpenBlock {
                index: self.raw_blocks[cat as usize].len() as u32,
                data: Vec::with_capacity(usable),
            });
            let space = usable - open.data.len();
            let take = space.min(data.len());
            self.object_chunks[object].push(PendingChunk {
                category: cat,
                cat_block_index: open.index,
                offset: open.data.len() as u32,
                size: take as u32,
            });
            open.data.extend_from_slice(&data[..take]);
            data = &data[take..];

            if open.data.len() == usable {
                let full = self.open_blocks[cat as usize].take().unwrap();
                self.raw_blocks[cat as usize].push(full.data);
            }
        }
    }

    fn finish(mut self) -> Result<FilledBlocks> {
        for cat in 0..self.open_blocks.len() {
            if let Some(open) = self.open_blocks[cat].take() {
                self.raw_blocks[cat].push(open.data);
            }
        }
        Ok(FilledBlocks {
            category_names: self.category_names,
            category_metadata: self.category_metadata,
            raw_blocks: self.raw_blocks,
            object_chunks: self.object_chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::RealOs;

    fn write_file(dir: &Path, name: &str, data: &[u8]) {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::File::create(path).unwrap().write_all(data).unwrap();
    }

    fn build(dir: &Path, options: WriterOptions) -> Vec<u8> {
        let os: Arc<dyn OsAccess> = Arc::new(RealOs);
        let writer = FilesystemWriter::new(options).unwrap();
        let mut out = Vec::new();
        writer.write_image(&os, dir, &mut out).unwrap();
        out
    }

    fn test_options() -> WriterOptions {
        WriterOptions {
            block_size: 1 << 16,
            metadata: MetadataBuilderOptions {
                no_create_timestamp: true,
                ..Default::default()
            },
            enable_history: false,
            ..Default::default()
        }
    }

    #[test]
    fn image_is_structurally_valid() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "hello.txt", b"hello dwarfs");
        write_file(dir.path(), "sub/data.bin", &vec![7u8; 100_000]);

        let img = build(dir.path(), test_options());
        let sections = crate::section::load_sections(&img).unwrap();
        // blocks, schema, metadata, index
        assert!(sections.len() >= 4);
        for s in &sections {
            s.verify(&img, crate::section::VerifyLevel::Integrity).unwrap();
        }
        assert_eq!(
            sections.last().unwrap().section_type(),
            Some(SectionType::SectionIndex)
        );
    }

    #[test]
    fn build_is_deterministic_across_worker_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a", &vec![1u8; 200_000]);
        write_file(dir.path(), "b", &(0..150_000u32).flat_map(u32::to_le_bytes).collect::<Vec<_>>());
        write_file(dir.path(), "c/d", b"small");

        let mut opts1 = test_options();
        opts1.num_workers = 1;
        let mut opts8 = test_options();
        opts8.num_workers = 8;

        let img1 = build(dir.path(), opts1.clone());
        let img1b = build(dir.path(), opts1);
        let img8 = build(dir.path(), opts8);
        assert_eq!(img1, img1b);
        assert_eq!(img1, img8);
    }

    #[test]
    fn categorizer_splits_streams() {
        struct HalfSplit;
        impl Categorizer for HalfSplit {
            fn categorize(&self, _: &Path, data: &[u8]) -> Vec<(String, u64)> {
                let half = (data.len() / 2) as u64;
                vec![
                    ("left".to_string(), half),
                    ("right".to_string(), data.len() as u64 - half),
                ]
            }
        }

        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "f", &vec![9u8; 10_000]);

        let os: Arc<dyn OsAccess> = Arc::new(RealOs);
        let mut writer = FilesystemWriter::new(test_options()).unwrap();
        writer.set_categorizer(Box::new(HalfSplit));
        let mut out = Vec::new();
        let report = writer.write_image(&os, dir.path(), &mut out).unwrap();
        assert_eq!(report.num_blocks, 2);

        let sections = crate::section::load_sections(&out).unwrap();
        let blocks: Vec<_> = sections
            .iter()
            .filter(|s| s.section_type() == Some(SectionType::Block))
            .collect();
        assert_eq!(blocks.len(), 2);
    }
}
