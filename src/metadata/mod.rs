//! Frozen metadata — the data model behind every image.
//!
//! Metadata is written as two sections: `METADATA_V2_SCHEMA` holds a JSON
//! schema descriptor (scalars, packing flags, and a table directory), and
//! `METADATA_V2` holds the concatenated little-endian tables themselves.
//! Readers resolve tables by *name* through the directory, so new tables can
//! be added without breaking old readers.
//!
//! # Tables
//!
//! ```text
//! Name                     Elem  Contents
//! chunks                    12   { block u32, offset u32, size u32 }
//! directories               12   { parent_entry u32, first_entry u32, self_entry u32 } + sentinel
//! directories_packed         4   first_entry deltas (parent/self rebuilt on load)
//! inodes                    24   { mode_index, owner_index, group_index,
//!                                  atime_offset, mtime_offset, ctime_offset } all u32
//! dir_entries                8   { name_index u32, inode_num u32 }
//! chunk_table                4   u32, one per chunk list + sentinel (delta-packed optional)
//! symlink_table              4   u32, symlink inode → symlinks string index
//! uids / gids / modes        4   u32 interning tables
//! names_buffer / _index    1/4   string pool + plain offsets or packed lengths
//! symlinks_buffer / _index 1/4   likewise
//! shared_files_table         4   u32 (run-length packed optional)
//! devices                    8   u64, device inode → rdev
//! block_categories           4   u32, block → category_names index
//! block_category_metadata    8   { block u32, metadata_index u32 }
//! size_cache                12   { inode u32, size u64 }
//! entry_table_v2_2           8   legacy pre-2.2 entries (see `builder`)
//! ```
//!
//! Inodes are partitioned by rank in the fixed order directory, symlink,
//! regular, device, other; this partitioning is an invariant.  Within the
//! regular partition, unique files come first, then shared files whose
//! chunk lists are resolved through `shared_files_table`.
//!
//! Timestamps are stored as offsets from `timestamp_base`, divided by
//! `time_resolution_sec`.

pub mod builder;
mod view;

pub use builder::{upgrade_from_v2_2, BuilderEntry, BuilderEntryKind, MetadataBuilder, MetadataBuilderOptions};
pub use view::{FileStat, InodeView, MetadataView, WalkEntry};

use std::collections::BTreeMap;
use std::io;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata schema error: {0}")]
    Schema(String),
    /// One of the §consistency invariants does not hold.
    #[error("metadata inconsistency: {0}")]
    Inconsistency(String),
    #[error("metadata index out of range: {0}")]
    IndexOutOfRange(String),
    /// The image declares a reader feature this build does not know.
    #[error("unsupported filesystem feature: {0}")]
    UnsupportedFeature(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Inode rank ───────────────────────────────────────────────────────────────

/// Coarse type class used to partition the inodes table.  The on-disk order
/// is fixed; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InodeRank {
    Directory = 0,
    Symlink = 1,
    Regular = 2,
    Device = 3,
    Other = 4,
}

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFCHR: u32 = 0o020000;

impl InodeRank {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => InodeRank::Directory,
            S_IFLNK => InodeRank::Symlink,
            S_IFREG => InodeRank::Regular,
            S_IFBLK | S_IFCHR => InodeRank::Device,
            _ => InodeRank::Other,
        }
    }
}

// ── Plain table records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub block: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Directory {
    pub parent_entry: u32,
    pub first_entry: u32,
    pub self_entry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name_index: u32,
    pub inode_num: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeData {
    pub mode_index: u32,
    pub owner_index: u32,
    pub group_index: u32,
    pub atime_offset: u32,
    pub mtime_offset: u32,
    pub ctime_offset: u32,
}

// ── String tables ────────────────────────────────────────────────────────────

/// Maximum entry length permitted in a *packed* names index.
pub const MAX_PACKED_NAME_LEN: u32 = 512;
/// Maximum entry length permitted in a *packed* symlinks index.
pub const MAX_PACKED_SYMLINK_LEN: u32 = 4096;

/// A string pool with either a plain offset index (`count + 1` offsets) or a
/// packed index of per-entry lengths (delta form of the offsets).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTable {
    pub buffer: Vec<u8>,
    pub index: Vec<u32>,
    pub packed_index: bool,
}

impl StringTable {
    pub fn len(&self) -> usize {
        if self.packed_index {
            self.index.len()
        } else {
            self.index.len().saturating_sub(1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: u32) -> Result<&[u8], MetadataError> {
        let i = i as usize;
        if i >= self.len() {
            return Err(MetadataError::IndexOutOfRange(format!(
                "string index {} >= {}",
                i,
                self.len()
            )));
        }
        let (start, end) = if self.packed_index {
            // Packed form stores lengths; offsets are their prefix sums.
            // Tables are small enough that the scan beats carrying a second
            // index, and `unpack_index` exists for hot paths.
            let start: u64 = self.index[..i].iter().map(|&l| u64::from(l)).sum();
            (start as usize, (start + u64::from(self.index[i])) as usize)
        } else {
            (self.index[i] as usize, self.index[i + 1] as usize)
        };
        if end > self.buffer.len() || start > end {
            return Err(MetadataError::Inconsistency(format!(
                "string table range {start}..{end} exceeds buffer ({} B)",
                self.buffer.len()
            )));
        }
        Ok(&self.buffer[start..end])
    }

    /// Convert a plain offset index into packed lengths in place.
    pub fn pack_index(&mut self) {
        if self.packed_index {
            return;
        }
        self.index = self.index.windows(2).map(|w| w[1] - w[0]).collect();
        self.packed_index = true;
    }

    /// Convert a packed index into plain offsets in place.
    pub fn unpack_index(&mut self) {
        if !self.packed_index {
            return;
        }
        let mut offsets = Vec::with_capacity(self.index.len() + 1);
        let mut pos = 0u32;
        offsets.push(0);
        for &len in &self.index {
            pos += len;
            offsets.push(pos);
        }
        self.index = offsets;
        self.packed_index = false;
    }

    /// Check packed-index entry lengths against `max_len` and the buffer.
    pub fn check(&self, what: &str, max_len: u32) -> Result<(), MetadataError> {
        let total: u64 = if self.packed_index {
            if let Some(bad) = self.index.iter().find(|&&l| l > max_len) {
                return Err(MetadataError::Inconsistency(format!(
                    "packed {what} index entry length {bad} > {max_len}"
                )));
            }
            self.index.iter().map(|&l| u64::from(l)).sum()
        } else {
            if !self.index.windows(2).all(|w| w[0] <= w[1]) {
                return Err(MetadataError::Inconsistency(format!(
                    "{what} index is not sorted"
                )));
            }
            u64::from(self.index.last().copied().unwrap_or(0))
        };
        if total > self.buffer.len() as u64 {
            return Err(MetadataError::Inconsistency(format!(
                "{what} index spans {total} B, buffer has {} B",
                self.buffer.len()
            )));
        }
        Ok(())
    }
}

// ── Options & auxiliary structures ───────────────────────────────────────────

/// On-disk packing flags plus time handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataOptions {
    pub mtime_only: bool,
    pub time_resolution_sec: u32,
    pub packed_chunk_table: bool,
    pub packed_directories: bool,
    pub packed_shared_files_table: bool,
    pub packed_names_index: bool,
    pub packed_symlinks_index: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            mtime_only: false,
            time_resolution_sec: 1,
            packed_chunk_table: false,
            packed_directories: false,
            packed_shared_files_table: false,
            packed_names_index: false,
            packed_symlinks_index: false,
        }
    }
}

/// Precomputed sizes for regular files with at least `min_chunk_count`
/// chunks, so `getattr` on heavily fragmented files avoids a chunk walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeCache {
    pub min_chunk_count: u32,
    pub entries: BTreeMap<u32, u64>,
}

/// Reader features this build understands.  An image declaring anything
/// else must be rejected at open time.
pub const KNOWN_FEATURES: &[&str] = &["packed_metadata", "categories", "size_cache"];

// ── Metadata ─────────────────────────────────────────────────────────────────

/// The complete metadata value, in whatever packing state the options say.
///
/// [`MetadataView`] consumes one of these, unpacks it, validates it, and
/// provides the read API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub chunks: Vec<Chunk>,
    /// One per directory inode plus a sentinel.
    pub directories: Vec<Directory>,
    pub inodes: Vec<InodeData>,
    /// Absent on legacy pre-2.2 images (see `entry_table_v2_2`).
    pub dir_entries: Option<Vec<DirEntry>>,
    /// Legacy pre-2.2 entries whose `inode_num` values may be shared
    /// between regular files.  Upgraded on load.
    pub entry_table_v2_2: Option<Vec<DirEntry>>,
    /// One per chunk list plus a sentinel (delta-packed when the option is
    /// set).
    pub chunk_table: Vec<u32>,
    pub symlink_table: Vec<u32>,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    pub modes: Vec<u32>,
    pub names: StringTable,
    pub symlinks: StringTable,
    /// One per shared regular file (run-length packed when the option is
    /// set: one count per duplicate group).
    pub shared_files_table: Vec<u32>,
    pub devices: Vec<u64>,
    pub timestamp_base: u64,
    pub block_size: u32,
    pub total_fs_size: u64,
    pub options: MetadataOptions,
    pub features: Vec<String>,
    pub category_names: Vec<String>,
    pub block_categories: Vec<u32>,
    pub category_metadata_json: Vec<String>,
    pub block_category_metadata: BTreeMap<u32, u32>,
    pub reg_file_size_cache: Option<SizeCache>,
    pub dwarfs_version: Option<String>,
    pub create_timestamp: Option<u64>,
    pub preferred_path_separator: Option<u32>,
}

// ── Schema descriptor ────────────────────────────────────────────────────────

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct TableDesc {
    name: String,
    offset: u64,
    /// Element count (not bytes).
    count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Schema {
    version: u32,
    block_size: u32,
    total_fs_size: u64,
    timestamp_base: u64,
    options: MetadataOptions,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    category_names: Vec<String>,
    #[serde(default)]
    category_metadata_json: Vec<String>,
    #[serde(default)]
    dwarfs_version: Option<String>,
    #[serde(default)]
    create_timestamp: Option<u64>,
    #[serde(default)]
    preferred_path_separator: Option<u32>,
    #[serde(default)]
    size_cache_min_chunk_count: Option<u32>,
    tables: Vec<TableDesc>,
}

fn elem_width(name: &str) -> Option<usize> {
    Some(match name {
        "chunks" | "directories" | "size_cache" => 12,
        "inodes" => 24,
        "dir_entries" | "devices" | "block_category_metadata" | "entry_table_v2_2" => 8,
        "directories_packed" | "chunk_table" | "symlink_table" | "uids" | "gids" | "modes"
        | "names_index" | "symlinks_index" | "shared_files_table" | "block_categories" => 4,
        "names_buffer" | "symlinks_buffer" => 1,
        _ => return None,
    })
}

// ── Serialization ────────────────────────────────────────────────────────────

struct TableWriter {
    data: Vec<u8>,
    tables: Vec<TableDesc>,
}

impl TableWriter {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            tables: Vec::new(),
        }
    }

    fn begin(&mut self, name: &str) -> u64 {
        self.tables.push(TableDesc {
            name: name.to_string(),
            offset: self.data.len() as u64,
            count: 0,
        });
        self.data.len() as u64
    }

    fn finish(&mut self, count: usize) {
        self.tables.last_mut().unwrap().count = count as u64;
    }

    fn u32s(&mut self, name: &str, values: &[u32]) {
        if values.is_empty() {
            return;
        }
        self.begin(name);
        let at = self.data.len();
        self.data.resize(at + values.len() * 4, 0);
        LittleEndian::write_u32_into(values, &mut self.data[at..]);
        self.finish(values.len());
    }

    fn u64s(&mut self, name: &str, values: &[u64]) {
        if values.is_empty() {
            return;
        }
        self.begin(name);
        let at = self.data.len();
        self.data.resize(at + values.len() * 8, 0);
        LittleEndian::write_u64_into(values, &mut self.data[at..]);
        self.finish(values.len());
    }

    fn bytes(&mut self, name: &str, values: &[u8]) {
        if values.is_empty() {
            return;
        }
        self.begin(name);
        self.data.extend_from_slice(values);
        self.finish(values.len());
    }
}

impl Metadata {
    /// Serialize into `(schema_payload, metadata_payload)`.
    pub fn to_sections(&self) -> Result<(Vec<u8>, Vec<u8>), MetadataError> {
        let mut tw = TableWriter::new();

        if !self.chunks.is_empty() {
            tw.begin("chunks");
            for c in &self.chunks {
                tw.data.extend_from_slice(&c.block.to_le_bytes());
                tw.data.extend_from_slice(&c.offset.to_le_bytes());
                tw.data.extend_from_slice(&c.size.to_le_bytes());
            }
            tw.finish(self.chunks.len());
        }

        if self.options.packed_directories {
            // Delta-coded first_entry only; parent/self rebuilt on load.
            let mut deltas = Vec::with_capacity(self.directories.len());
            let mut last = 0u32;
            for d in &self.directories {
                deltas.push(d.first_entry - last);
                last = d.first_entry;
            }
            tw.u32s("directories_packed", &deltas);
        } else if !self.directories.is_empty() {
            tw.begin("directories");
            for d in &self.directories {
                tw.data.extend_from_slice(&d.parent_entry.to_le_bytes());
                tw.data.extend_from_slice(&d.first_entry.to_le_bytes());
                tw.data.extend_from_slice(&d.self_entry.to_le_bytes());
            }
            tw.finish(self.directories.len());
        }

        if !self.inodes.is_empty() {
            tw.begin("inodes");
            for i in &self.inodes {
                for f in [
                    i.mode_index,
                    i.owner_index,
                    i.group_index,
                    i.atime_offset,
                    i.mtime_offset,
                    i.ctime_offset,
                ] {
                    tw.data.extend_from_slice(&f.to_le_bytes());
                }
            }
            tw.finish(self.inodes.len());
        }

        let write_entries = |tw: &mut TableWriter, name: &str, entries: &[DirEntry]| {
            if entries.is_empty() {
                return;
            }
            tw.begin(name);
            for e in entries {
                tw.data.extend_from_slice(&e.name_index.to_le_bytes());
                tw.data.extend_from_slice(&e.inode_num.to_le_bytes());
            }
            tw.finish(entries.len());
        };
        if let Some(de) = &self.dir_entries {
            write_entries(&mut tw, "dir_entries", de);
        }
        if let Some(et) = &self.entry_table_v2_2 {
            write_entries(&mut tw, "entry_table_v2_2", et);
        }

        tw.u32s("chunk_table", &self.chunk_table);
        tw.u32s("symlink_table", &self.symlink_table);
        tw.u32s("uids", &self.uids);
        tw.u32s("gids", &self.gids);
        tw.u32s("modes", &self.modes);
        tw.bytes("names_buffer", &self.names.buffer);
        tw.u32s("names_index", &self.names.index);
        tw.bytes("symlinks_buffer", &self.symlinks.buffer);
        tw.u32s("symlinks_index", &self.symlinks.index);
        tw.u32s("shared_files_table", &self.shared_files_table);
        tw.u64s("devices", &self.devices);
        tw.u32s("block_categories", &self.block_categories);

        if !self.block_category_metadata.is_empty() {
            tw.begin("block_category_metadata");
            for (&block, &md) in &self.block_category_metadata {
                tw.data.extend_from_slice(&block.to_le_bytes());
                tw.data.extend_from_slice(&md.to_le_bytes());
            }
            tw.finish(self.block_category_metadata.len());
        }

        if let Some(sc) = &self.reg_file_size_cache {
            if !sc.entries.is_empty() {
                tw.begin("size_cache");
                for (&ino, &size) in &sc.entries {
                    tw.data.extend_from_slice(&ino.to_le_bytes());
                    tw.data.extend_from_slice(&size.to_le_bytes());
                }
                tw.finish(sc.entries.len());
            }
        }

        debug_assert!(
            self.names.packed_index == self.options.packed_names_index
                && self.symlinks.packed_index == self.options.packed_symlinks_index,
            "string table form disagrees with options"
        );

        let schema = Schema {
            version: SCHEMA_VERSION,
            block_size: self.block_size,
            total_fs_size: self.total_fs_size,
            timestamp_base: self.timestamp_base,
            options: self.options.clone(),
            features: self.features.clone(),
            category_names: self.category_names.clone(),
            category_metadata_json: self.category_metadata_json.clone(),
            dwarfs_version: self.dwarfs_version.clone(),
            create_timestamp: self.create_timestamp,
            preferred_path_separator: self.preferred_path_separator,
            size_cache_min_chunk_count: self
                .reg_file_size_cache
                .as_ref()
                .map(|sc| sc.min_chunk_count),
            tables: tw.tables,
        };

        let schema_bytes =
            serde_json::to_vec(&schema).map_err(|e| MetadataError::Schema(e.to_string()))?;

        Ok((schema_bytes, tw.data))
    }

    /// Deserialize from the two section payloads.  Unknown tables are
    /// skipped for forward compatibility; unknown features are fatal.
    pub fn from_sections(schema_bytes: &[u8], data: &[u8]) -> Result<Self, MetadataError> {
        let schema: Schema = serde_json::from_slice(schema_bytes)
            .map_err(|e| MetadataError::Schema(e.to_string()))?;

        if schema.version != SCHEMA_VERSION {
            return Err(MetadataError::Schema(format!(
                "unsupported metadata schema version {}",
                schema.version
            )));
        }
        for feature in &schema.features {
            if !KNOWN_FEATURES.contains(&feature.as_str()) {
                return Err(MetadataError::UnsupportedFeature(feature.clone()));
            }
        }

        let mut md = Metadata {
            block_size: schema.block_size,
            total_fs_size: schema.total_fs_size,
            timestamp_base: schema.timestamp_base,
            options: schema.options,
            features: schema.features,
            category_names: schema.category_names,
            category_metadata_json: schema.category_metadata_json,
            dwarfs_version: schema.dwarfs_version,
            create_timestamp: schema.create_timestamp,
            preferred_path_separator: schema.preferred_path_separator,
            ..Metadata::default()
        };

        let mut size_cache_entries = BTreeMap::new();

        for t in &schema.tables {
            let Some(width) = elem_width(&t.name) else {
                continue; // table from a future writer
            };
            let start = t.offset as usize;
            let len = t.count as usize * width;
            let end = start
                .checked_add(len)
                .ok_or_else(|| MetadataError::Schema(format!("table '{}' overflows", t.name)))?;
            if end > data.len() {
                return Err(MetadataError::Schema(format!(
                    "table '{}' exceeds metadata payload: {} > {}",
                    t.name,
                    end,
                    data.len()
                )));
            }
            let bytes = &data[start..end];

            let u32_at =
                |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());

            match t.name.as_str() {
                "chunks" => {
                    md.chunks = bytes
                        .chunks_exact(12)
                        .map(|c| Chunk {
                            block: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                            offset: u32::from_le_bytes(c[4..8].try_into().unwrap()),
                            size: u32::from_le_bytes(c[8..12].try_into().unwrap()),
                        })
                        .collect();
                }
                "directories" => {
                    md.directories = bytes
                        .chunks_exact(12)
                        .map(|c| Directory {
                            parent_entry: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                            first_entry: u32::from_le_bytes(c[4..8].try_into().unwrap()),
                            self_entry: u32::from_le_bytes(c[8..12].try_into().unwrap()),
                        })
                        .collect();
                }
                "directories_packed" => {
                    // Prefix-sum the deltas; parent/self rebuilt by the view.
                    let mut acc = 0u32;
                    md.directories = (0..t.count as usize)
                        .map(|i| {
                            acc += u32_at(i);
                            Directory {
                                parent_entry: 0,
                                first_entry: acc,
                                self_entry: 0,
                            }
                        })
                        .collect();
                }
                "inodes" => {
                    md.inodes = bytes
                        .chunks_exact(24)
                        .map(|c| InodeData {
                            mode_index: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                            owner_index: u32::from_le_bytes(c[4..8].try_into().unwrap()),
                            group_index: u32::from_le_bytes(c[8..12].try_into().unwrap()),
                            atime_offset: u32::from_le_bytes(c[12..16].try_into().unwrap()),
                            mtime_offset: u32::from_le_bytes(c[16..20].try_into().unwrap()),
                            ctime_offset: u32::from_le_bytes(c[20..24].try_into().unwrap()),
                        })
                        .collect();
                }
                "dir_entries" | "entry_table_v2_2" => {
                    let entries: Vec<DirEntry> = bytes
                        .chunks_exact(8)
                        .map(|c| DirEntry {
                            name_index: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                            inode_num: u32::from_le_bytes(c[4..8].try_into().unwrap()),
                        })
                        .collect();
                    if t.name == "dir_entries" {
                        md.dir_entries = Some(entries);
                    } else {
                        md.entry_table_v2_2 = Some(entries);
                    }
                }
                "chunk_table" => md.chunk_table = read_u32s(bytes),
                "symlink_table" => md.symlink_table = read_u32s(bytes),
                "uids" => md.uids = read_u32s(bytes),
                "gids" => md.gids = read_u32s(bytes),
                "modes" => md.modes = read_u32s(bytes),
                "names_buffer" => md.names.buffer = bytes.to_vec(),
                "names_index" => md.names.index = read_u32s(bytes),
                "symlinks_buffer" => md.symlinks.buffer = bytes.to_vec(),
                "symlinks_index" => md.symlinks.index = read_u32s(bytes),
                "shared_files_table" => md.shared_files_table = read_u32s(bytes),
                "devices" => {
                    md.devices = bytes
                        .chunks_exact(8)
                        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                }
                "block_categories" => md.block_categories = read_u32s(bytes),
                "block_category_metadata" => {
                    md.block_category_metadata = bytes
                        .chunks_exact(8)
                        .map(|c| {
                            (
                                u32::from_le_bytes(c[0..4].try_into().unwrap()),
                                u32::from_le_bytes(c[4..8].try_into().unwrap()),
                            )
                        })
                        .collect();
                }
                "size_cache" => {
                    size_cache_entries = bytes
                        .chunks_exact(12)
                        .map(|c| {
                            (
                                u32::from_le_bytes(c[0..4].try_into().unwrap()),
                                u64::from_le_bytes(c[4..12].try_into().unwrap()),
                            )
                        })
                        .collect();
                }
                _ => unreachable!("elem_width covered '{}'", t.name),
            }
        }

        md.names.packed_index = md.options.packed_names_index;
        md.symlinks.packed_index = md.options.packed_symlinks_index;

        if let Some(min) = schema.size_cache_min_chunk_count {
            md.reg_file_size_cache = Some(SizeCache {
                min_chunk_count: min,
                entries: size_cache_entries,
            });
        }

        Ok(md)
    }
}

fn read_u32s(bytes: &[u8]) -> Vec<u32> {
    let mut out = vec![0u32; bytes.len() / 4];
    LittleEndian::read_u32_into(bytes, &mut out);
    out
}
