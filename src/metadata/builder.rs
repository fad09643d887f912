//! Metadata builder — turns a scanned tree into a packed [`Metadata`] value.
//!
//! The writer hands over one [`BuilderEntry`] tree plus a chunk list per
//! content object; the builder assigns inode numbers (directories in
//! pre-order, so parents always precede children), interns modes/uids/gids
//! and strings, derives the shared-files table from the scanner's object
//! numbers, and applies the packing options: delta-coded chunk table and
//! directories, run-length shared-files table, packed string-table indices.
//!
//! Regular-file ordering contract (established by the file scanner):
//! regular index `ri` maps to content object `object[ri]`, with
//! `object[ri] == ri` for the unique prefix and a dense, non-decreasing
//! tail for shared files.  The builder validates this rather than trusting
//! it.
//!
//! `upgrade_from_v2_2` converts a legacy snapshot (entries whose inode
//! numbers may be shared between regular files) into the modern form by
//! giving every file instance its own inode number and routing the shared
//! chunk lists through the shared-files table.  On-disk chunk order is
//! preserved.

use std::collections::HashMap;

use super::{
    Chunk, DirEntry, Directory, InodeData, InodeRank, Metadata, MetadataError, MetadataOptions,
    SizeCache, StringTable,
};

// re-exported through metadata::*
pub use self::entry::{BuilderEntry, BuilderEntryKind};

use self::entry::BuilderEntryKind as Kind;

mod entry {
    /// One filesystem object handed to the builder.
    #[derive(Debug, Clone)]
    pub struct BuilderEntry {
        /// Entry name (empty for the root).
        pub name: Vec<u8>,
        pub kind: BuilderEntryKind,
        pub mode: u32,
        pub uid: u32,
        pub gid: u32,
        pub atime: u64,
        pub mtime: u64,
        pub ctime: u64,
    }

    #[derive(Debug, Clone)]
    pub enum BuilderEntryKind {
        Directory { children: Vec<BuilderEntry> },
        /// `regular_index` is the scanner-assigned index within the regular
        /// partition (hardlinks repeat it); `object` is the content object
        /// owning the chunk list.
        File { regular_index: u32, object: u32 },
        Symlink { target: Vec<u8> },
        Device { rdev: u64 },
        Other,
    }

    impl BuilderEntry {
        pub fn directory(name: impl Into<Vec<u8>>, mode: u32) -> Self {
            BuilderEntry {
                name: name.into(),
                kind: BuilderEntryKind::Directory { children: Vec::new() },
                mode,
                uid: 0,
                gid: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
            }
        }

        pub fn push_child(&mut self, child: BuilderEntry) {
            match &mut self.kind {
                BuilderEntryKind::Directory { children } => children.push(child),
                _ => panic!("push_child on non-directory entry"),
            }
        }
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Writer-side metadata options (see the recognized-options table in the
/// crate docs).  `pack_names`/`pack_symlinks` select the packed index form
/// of the respective string table; symbol-table compression of the string
/// *buffers* is not supported by this implementation.
#[derive(Debug, Clone)]
pub struct MetadataBuilderOptions {
    /// Override all owners with a fixed uid.
    pub uid: Option<u32>,
    /// Override all groups with a fixed gid.
    pub gid: Option<u32>,
    pub time_resolution_sec: u32,
    /// Store atime/ctime in addition to mtime.
    pub keep_all_times: bool,
    pub pack_chunk_table: bool,
    pub pack_directories: bool,
    pub pack_shared_files_table: bool,
    pub pack_names: bool,
    pub pack_names_index: bool,
    pub pack_symlinks: bool,
    pub pack_symlinks_index: bool,
    pub force_pack_string_tables: bool,
    pub plain_names_table: bool,
    pub plain_symlinks_table: bool,
    pub no_category_names: bool,
    pub no_category_metadata: bool,
    /// Omit the creation timestamp (reproducible builds).
    pub no_create_timestamp: bool,
    /// Minimum chunk count for the inode size cache; 0 disables it.
    pub inode_size_cache_min_chunk_count: u32,
}

impl Default for MetadataBuilderOptions {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            time_resolution_sec: 1,
            keep_all_times: false,
            pack_chunk_table: true,
            pack_directories: true,
            pack_shared_files_table: true,
            pack_names: false,
            pack_names_index: true,
            pack_symlinks: false,
            pack_symlinks_index: true,
            force_pack_string_tables: false,
            plain_names_table: false,
            plain_symlinks_table: false,
            no_category_names: false,
            no_category_metadata: false,
            no_create_timestamp: false,
            inode_size_cache_min_chunk_count: 128,
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct MetadataBuilder {
    options: MetadataBuilderOptions,
    root: Option<BuilderEntry>,
    /// chunk list per content object
    chunk_lists: Vec<Option<Vec<Chunk>>>,
    block_size: u32,
    category_names: Vec<String>,
    block_categories: Vec<u32>,
    category_metadata_json: Vec<String>,
    block_category_metadata: std::collections::BTreeMap<u32, u32>,
}

impl MetadataBuilder {
    pub fn new(options: MetadataBuilderOptions) -> Self {
        Self {
            options,
            root: None,
            chunk_lists: Vec::new(),
            block_size: 0,
            category_names: Vec::new(),
            block_categories: Vec::new(),
            category_metadata_json: Vec::new(),
            block_category_metadata: std::collections::BTreeMap::new(),
        }
    }

    pub fn set_root(&mut self, root: BuilderEntry) {
        self.root = Some(root);
    }

    pub fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    pub fn set_chunk_list(&mut self, object: u32, chunks: Vec<Chunk>) {
        let object = object as usize;
        if self.chunk_lists.len() <= object {
            self.chunk_lists.resize(object + 1, None);
        }
        self.chunk_lists[object] = Some(chunks);
    }

    pub fn set_categories(
        &mut self,
        names: Vec<String>,
        block_categories: Vec<u32>,
        metadata_json: Vec<String>,
        block_metadata: std::collections::BTreeMap<u32, u32>,
    ) {
        self.category_names = names;
        self.block_categories = block_categories;
        self.category_metadata_json = metadata_json;
        self.block_category_metadata = block_metadata;
    }

    pub fn build(self) -> Result<Metadata, MetadataError> {
        let root = self
            .root
            .ok_or_else(|| MetadataError::Schema("builder has no root entry".into()))?;
        if !self.block_size.is_power_of_two() {
            return Err(MetadataError::Schema(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }

        // Flatten the tree: pre-order directory numbering, then collect
        // symlink / regular / device / other members.
        let mut flat = FlatTree::default();
        flat.collect(&root)?;

        let dir_count = flat.dirs.len() as u32;
        let symlink_count = flat.symlinks.len() as u32;
        let file_count = flat
            .files
            .iter()
            .map(|f| f.regular_index + 1)
            .max()
            .unwrap_or(0);
        let device_count = flat.devices.len() as u32;
        let other_count = flat.others.len() as u32;

        let symlink_offset = dir_count;
        let file_offset = symlink_offset + symlink_count;
        let device_offset = file_offset + file_count;
        let other_offset = device_offset + device_count;
        let inode_count = other_offset + other_count;

        // Validate the scanner's object numbering and derive the shared
        // files table.
        let (num_unique, shared_files_table, objects) =
            derive_object_layout(&flat.files, file_count)?;

        let num_objects = objects;
        if self.chunk_lists.len() < num_objects as usize
            || self.chunk_lists[..num_objects as usize]
                .iter()
                .any(Option::is_none)
        {
            return Err(MetadataError::Schema(format!(
                "missing chunk list: {} objects expected",
                num_objects
            )));
        }

        // chunk table over object-ordered chunk lists
        let mut chunks = Vec::new();
        let mut chunk_table = Vec::with_capacity(num_objects as usize + 1);
        chunk_table.push(0u32);
        for list in self.chunk_lists[..num_objects as usize].iter().flatten() {
            chunks.extend_from_slice(list);
            chunk_table.push(chunks.len() as u32);
        }

        // interning tables
        let mut interner = Interner::new(&self.options, &flat)?;

        // inodes table, rank by rank
        let mut inodes = vec![InodeData::default(); inode_count as usize];
        for (d, e) in flat.dirs.iter().enumerate() {
            inodes[d] = interner.inode_data(e)?;
        }
        for (s, e) in flat.symlinks.iter().enumerate() {
            inodes[(symlink_offset + s as u32) as usize] = interner.inode_data(e)?;
        }
        for f in &flat.files {
            inodes[(file_offset + f.regular_index) as usize] = interner.inode_data(&f.entry)?;
        }
        for (d, e) in flat.devices.iter().enumerate() {
            inodes[(device_offset + d as u32) as usize] = interner.inode_data(&e.entry)?;
        }
        for (o, e) in flat.others.iter().enumerate() {
            inodes[(other_offset + o as u32) as usize] = interner.inode_data(e)?;
        }

        // strings
        let mut names = StringPool::new();
        let mut symlink_strings = StringPool::new();
        let symlink_table: Vec<u32> = flat
            .symlinks
            .iter()
            .map(|e| match &e.kind {
                Kind::Symlink { target } => symlink_strings.intern(target),
                _ => unreachable!(),
            })
            .collect();
        let devices: Vec<u64> = flat
            .devices
            .iter()
            .map(|d| match &d.entry.kind {
                Kind::Device { rdev } => *rdev,
                _ => unreachable!(),
            })
            .collect();

        // directory entries; children sorted by name, entry 0 is the root's
        // synthetic self entry
        let mut dir_entries = Vec::new();
        dir_entries.push(DirEntry {
            name_index: names.intern(b""),
            inode_num: 0,
        });
        let mut directories = vec![Directory::default(); dir_count as usize + 1];
        directories[0].first_entry = 1;
        directories[0].parent_entry = 0;
        directories[0].self_entry = 0;

        // flat.dirs is in pre-order; children lists carry resolved inode
        // numbers via the flat tree's child records.
        for d in 0..dir_count as usize {
            directories[d].first_entry = dir_entries.len() as u32;
            let mut children = flat.children[d].clone();
            children.sort_by(|a, b| a.name.cmp(&b.name));
            for c in &children {
                let inode_num = c.resolve(symlink_offset, file_offset, device_offset, other_offset);
                let entry_index = dir_entries.len() as u32;
                dir_entries.push(DirEntry {
                    name_index: names.intern(&c.name),
                    inode_num,
                });
                if c.is_dir() {
                    directories[inode_num as usize].self_entry = entry_index;
                    directories[inode_num as usize].parent_entry = directories[d].self_entry;
                }
            }
        }
        directories[dir_count as usize].first_entry = dir_entries.len() as u32;

        // total logical size: every object counted once
        let total_fs_size: u64 = (0..num_objects as usize)
            .map(|o| {
                self.chunk_lists[o]
                    .as_ref()
                    .unwrap()
                    .iter()
                    .map(|c| u64::from(c.size))
                    .sum::<u64>()
            })
            .sum();

        // optional per-inode size cache for heavily fragmented files
        let reg_file_size_cache = if self.options.inode_size_cache_min_chunk_count > 0 {
            let min = self.options.inode_size_cache_min_chunk_count;
            let mut entries = std::collections::BTreeMap::new();
            for f in &flat.files {
                let cli = object_for(&shared_files_table, num_unique, f.regular_index);
                let nchunks = chunk_table[cli as usize + 1] - chunk_table[cli as usize];
                if nchunks >= min {
                    let size: u64 = chunks
                        [chunk_table[cli as usize] as usize..chunk_table[cli as usize + 1] as usize]
                        .iter()
                        .map(|c| u64::from(c.size))
                        .sum();
                    entries.insert(file_offset + f.regular_index, size);
                }
            }
            Some(SizeCache {
                min_chunk_count: min,
                entries,
            })
        } else {
            None
        };

        let opts = &self.options;
        let pack_names_index =
            (opts.pack_names_index || opts.pack_names || opts.force_pack_string_tables)
                && !opts.plain_names_table;
        let pack_symlinks_index =
            (opts.pack_symlinks_index || opts.pack_symlinks || opts.force_pack_string_tables)
                && !opts.plain_symlinks_table;

        let options = MetadataOptions {
            mtime_only: !opts.keep_all_times,
            time_resolution_sec: opts.time_resolution_sec.max(1),
            packed_chunk_table: opts.pack_chunk_table,
            packed_directories: opts.pack_directories,
            packed_shared_files_table: opts.pack_shared_files_table
                && !shared_files_table.is_empty(),
            packed_names_index: pack_names_index,
            packed_symlinks_index: pack_symlinks_index,
        };

        let mut features = Vec::new();
        if options.packed_chunk_table
            || options.packed_directories
            || options.packed_shared_files_table
            || options.packed_names_index
            || options.packed_symlinks_index
        {
            features.push("packed_metadata".to_string());
        }
        if !self.block_categories.is_empty() && !opts.no_category_names {
            features.push("categories".to_string());
        }
        if reg_file_size_cache.is_some() {
            features.push("size_cache".to_string());
        }

        let (category_names, block_categories) = if opts.no_category_names {
            (Vec::new(), Vec::new())
        } else {
            (self.category_names, self.block_categories)
        };
        let (category_metadata_json, block_category_metadata) = if opts.no_category_metadata {
            (Vec::new(), std::collections::BTreeMap::new())
        } else {
            (self.category_metadata_json, self.block_category_metadata)
        };

        // The Metadata value always carries the on-disk representation; the
        // view unpacks on load.
        let chunk_table = if options.packed_chunk_table {
            delta_encode(&chunk_table)
        } else {
            chunk_table
        };
        let shared_files_table = if options.packed_shared_files_table {
            run_lengths(&shared_files_table)
        } else {
            shared_files_table
        };
        let mut names = names.into_table();
        if options.packed_names_index {
            names.pack_index();
        }
        let mut symlinks = symlink_strings.into_table();
        if options.packed_symlinks_index {
            symlinks.pack_index();
        }

        Ok(Metadata {
            chunks,
            directories,
            inodes,
            dir_entries: Some(dir_entries),
            entry_table_v2_2: None,
            chunk_table,
            symlink_table,
            uids: interner.uids.values,
            gids: interner.gids.values,
            modes: interner.modes.values,
            names,
            symlinks,
            shared_files_table,
            devices,
            timestamp_base: interner.timestamp_base,
            block_size: self.block_size,
            total_fs_size,
            options,
            features,
            category_names,
            block_categories,
            category_metadata_json,
            block_category_metadata,
            reg_file_size_cache,
            dwarfs_version: Some(concat!("dwarfs-", env!("CARGO_PKG_VERSION")).to_string()),
            create_timestamp: if opts.no_create_timestamp {
                None
            } else {
                Some(chrono::Utc::now().timestamp() as u64)
            },
            preferred_path_separator: Some(u32::from('/')),
        })
    }
}

fn delta_encode(values: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(values.len());
    let mut last = 0u32;
    for &v in values {
        out.push(v - last);
        last = v;
    }
    out
}

/// One member count per duplicate group.
fn run_lengths(shared: &[u32]) -> Vec<u32> {
    let mut counts = Vec::new();
    for &g in shared {
        if g as usize == counts.len() {
            counts.push(0u32);
        }
        counts[g as usize] += 1;
    }
    counts
}

fn object_for(shared: &[u32], num_unique: u32, regular_index: u32) -> u32 {
    if regular_index < num_unique {
        regular_index
    } else {
        num_unique + shared[(regular_index - num_unique) as usize]
    }
}

/// Validate the scanner's `regular_index → object` mapping and derive
/// `(num_unique, shared_files_table, num_objects)`.
fn derive_object_layout(
    files: &[FlatFile],
    file_count: u32,
) -> Result<(u32, Vec<u32>, u32), MetadataError> {
    let mut object_of = vec![u32::MAX; file_count as usize];
    for f in files {
        let slot = &mut object_of[f.regular_index as usize];
        if *slot != u32::MAX && *slot != f.object {
            return Err(MetadataError::Schema(format!(
                "regular index {} mapped to objects {} and {}",
                f.regular_index, *slot, f.object
            )));
        }
        *slot = f.object;
    }
    if let Some(hole) = object_of.iter().position(|&o| o == u32::MAX) {
        return Err(MetadataError::Schema(format!(
            "regular index {hole} has no file entry"
        )));
    }

    // Per-object inode multiplicity distinguishes the unique prefix from a
    // shared group whose first member coincidentally sits at `ri == object`.
    let max_object = object_of.iter().copied().max().map(|o| o + 1).unwrap_or(0);
    let mut multiplicity = vec![0u32; max_object as usize];
    for &o in &object_of {
        multiplicity[o as usize] += 1;
    }

    let num_unique = object_of
        .iter()
        .enumerate()
        .take_while(|(ri, &o)| o == *ri as u32 && multiplicity[o as usize] == 1)
        .count() as u32;

    let mut shared = Vec::with_capacity((file_count - num_unique) as usize);
    let mut prev: Option<u32> = None;
    for (ri, &o) in object_of.iter().enumerate().skip(num_unique as usize) {
        let dense = match prev {
            None => o == num_unique,
            Some(p) => o == p || o == p + 1,
        };
        if !dense {
            return Err(MetadataError::Schema(format!(
                "regular index {ri}: object {o} breaks the dense shared layout"
            )));
        }
        prev = Some(o);
        shared.push(o - num_unique);
    }

    let num_objects = num_unique + shared.last().map(|&g| g + 1).unwrap_or(0);
    Ok((num_unique, shared, num_objects))
}

// ── Flat tree ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ChildRef {
    name: Vec<u8>,
    rank: InodeRank,
    /// index within the rank's collection
    rank_index: u32,
}

impl ChildRef {
    fn is_dir(&self) -> bool {
        self.rank == InodeRank::Directory
    }

    fn resolve(&self, symlink_off: u32, file_off: u32, device_off: u32, other_off: u32) -> u32 {
        match self.rank {
            InodeRank::Directory => self.rank_index,
            InodeRank::Symlink => symlink_off + self.rank_index,
            InodeRank::Regular => file_off + self.rank_index,
            InodeRank::Device => device_off + self.rank_index,
            InodeRank::Other => other_off + self.rank_index,
        }
    }
}

struct FlatFile {
    entry: BuilderEntry,
    regular_index: u32,
    object: u32,
}

#[derive(Default)]
struct FlatTree {
    dirs: Vec<BuilderEntry>,
    /// children of each directory, parallel to `dirs`
    children: Vec<Vec<ChildRef>>,
    symlinks: Vec<BuilderEntry>,
    files: Vec<FlatFile>,
    devices: Vec<FlatFile>, // entry reused; regular_index/object unused
    others: Vec<BuilderEntry>,
}

impl FlatTree {
    fn collect(&mut self, root: &BuilderEntry) -> Result<(), MetadataError> {
        match &root.kind {
            Kind::Directory { .. } => {}
            _ => return Err(MetadataError::Schema("root entry is not a directory".into())),
        }
        self.visit_dir(root)?;
        Ok(())
    }

    /// Pre-order: record the directory itself, then descend.
    fn visit_dir(&mut self, dir: &BuilderEntry) -> Result<u32, MetadataError> {
        let my_index = self.dirs.len() as u32;
        self.dirs.push(shallow(dir));
        self.children.push(Vec::new());

        let Kind::Directory { children } = &dir.kind else {
            unreachable!()
        };

        let mut refs = Vec::with_capacity(children.len());
        for child in children {
            let r = match &child.kind {
                Kind::Directory { .. } => {
                    let idx = self.visit_dir(child)?;
                    ChildRef {
                        name: child.name.clone(),
                        rank: InodeRank::Directory,
                        rank_index: idx,
                    }
                }
                Kind::Symlink { .. } => {
                    self.symlinks.push(shallow(child));
                    ChildRef {
                        name: child.name.clone(),
                        rank: InodeRank::Symlink,
                        rank_index: (self.symlinks.len() - 1) as u32,
                    }
                }
                Kind::File { regular_index, object } => {
                    self.files.push(FlatFile {
                        entry: shallow(child),
                        regular_index: *regular_index,
                        object: *object,
                    });
                    ChildRef {
                        name: child.name.clone(),
                        rank: InodeRank::Regular,
                        rank_index: *regular_index,
                    }
                }
                Kind::Device { .. } => {
                    self.devices.push(FlatFile {
                        entry: shallow(child),
                        regular_index: 0,
                        object: 0,
                    });
                    ChildRef {
                        name: child.name.clone(),
                        rank: InodeRank::Device,
                        rank_index: (self.devices.len() - 1) as u32,
                    }
                }
                Kind::Other => {
                    self.others.push(shallow(child));
                    ChildRef {
                        name: child.name.clone(),
                        rank: InodeRank::Other,
                        rank_index: (self.others.len() - 1) as u32,
                    }
                }
            };
            refs.push(r);
        }
        self.children[my_index as usize] = refs;
        Ok(my_index)
    }
}

/// Copy an entry without its children (the flat tree keeps those itself).
fn shallow(e: &BuilderEntry) -> BuilderEntry {
    BuilderEntry {
        name: e.name.clone(),
        kind: match &e.kind {
            Kind::Directory { .. } => Kind::Directory { children: Vec::new() },
            other => other.clone(),
        },
        mode: e.mode,
        uid: e.uid,
        gid: e.gid,
        atime: e.atime,
        mtime: e.mtime,
        ctime: e.ctime,
    }
}

// ── Interning ────────────────────────────────────────────────────────────────

struct ValueInterner {
    values: Vec<u32>,
    index: HashMap<u32, u32>,
}

impl ValueInterner {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, v: u32) -> u32 {
        *self.index.entry(v).or_insert_with(|| {
            self.values.push(v);
            (self.values.len() - 1) as u32
        })
    }
}

struct Interner {
    modes: ValueInterner,
    uids: ValueInterner,
    gids: ValueInterner,
    uid_override: Option<u32>,
    gid_override: Option<u32>,
    timestamp_base: u64,
    time_resolution: u64,
    keep_all_times: bool,
}

impl Interner {
    fn new(opts: &MetadataBuilderOptions, flat: &FlatTree) -> Result<Self, MetadataError> {
        let res = u64::from(opts.time_resolution_sec.max(1));
        // base = minimum observed time, in resolution units
        let mut min_units = u64::MAX;
        let mut consider = |e: &BuilderEntry| {
            let times = if opts.keep_all_times {
                [e.atime, e.mtime, e.ctime]
            } else {
                [e.mtime, e.mtime, e.mtime]
            };
            for t in times {
                min_units = min_units.min(t / res);
            }
        };
        for e in &flat.dirs {
            consider(e);
        }
        for e in &flat.symlinks {
            consider(e);
        }
        for f in &flat.files {
            consider(&f.entry);
        }
        for d in &flat.devices {
            consider(&d.entry);
        }
        for e in &flat.others {
            consider(e);
        }
        if min_units == u64::MAX {
            min_units = 0;
        }

        Ok(Self {
            modes: ValueInterner::new(),
            uids: ValueInterner::new(),
            gids: ValueInterner::new(),
            uid_override: opts.uid,
            gid_override: opts.gid,
            timestamp_base: min_units * res,
            time_resolution: res,
            keep_all_times: opts.keep_all_times,
        })
    }

    fn time_offset(&self, t: u64) -> Result<u32, MetadataError> {
        let units = t / self.time_resolution - self.timestamp_base / self.time_resolution;
        u32::try_from(units)
            .map_err(|_| MetadataError::Schema(format!("timestamp offset {units} exceeds 32 bits")))
    }

    fn inode_data(&mut self, e: &BuilderEntry) -> Result<InodeData, MetadataError> {
        let mtime_offset = self.time_offset(e.mtime)?;
        let (atime_offset, ctime_offset) = if self.keep_all_times {
            (self.time_offset(e.atime)?, self.time_offset(e.ctime)?)
        } else {
            (0, 0)
        };
        Ok(InodeData {
            mode_index: self.modes.intern(e.mode),
            owner_index: self.uids.intern(self.uid_override.unwrap_or(e.uid)),
            group_index: self.gids.intern(self.gid_override.unwrap_or(e.gid)),
            atime_offset,
            mtime_offset,
            ctime_offset,
        })
    }
}

struct StringPool {
    buffer: Vec<u8>,
    offsets: Vec<u32>,
    dedup: HashMap<Vec<u8>, u32>,
}

impl StringPool {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            offsets: vec![0],
            dedup: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &[u8]) -> u32 {
        if let Some(&i) = self.dedup.get(s) {
            return i;
        }
        self.buffer.extend_from_slice(s);
        self.offsets.push(self.buffer.len() as u32);
        let i = (self.offsets.len() - 2) as u32;
        self.dedup.insert(s.to_vec(), i);
        i
    }

    fn into_table(self) -> StringTable {
        StringTable {
            buffer: self.buffer,
            index: self.offsets,
            packed_index: false,
        }
    }
}

// ── Legacy upgrade ───────────────────────────────────────────────────────────

/// Upgrade a pre-2.2 snapshot to the modern form.
///
/// In the legacy form `entry_table_v2_2` plays the role of `dir_entries`,
/// except that several regular-file entries may reference the *same* inode
/// number.  The upgrade gives every file instance its own inode number,
/// routes all of them through the shared-files table (every legacy chunk
/// list becomes one group), and shifts the device/other partitions up.
/// Chunk data and chunk order are untouched.
pub fn upgrade_from_v2_2(mut meta: Metadata) -> Result<Metadata, MetadataError> {
    let entries = meta
        .entry_table_v2_2
        .take()
        .ok_or_else(|| MetadataError::Schema("not a legacy v2.2 metadata".into()))?;
    if meta.dir_entries.is_some() {
        return Err(MetadataError::Inconsistency(
            "both dir_entries and entry_table_v2_2 present".into(),
        ));
    }

    // Partition boundaries in the *old* inode numbering.
    let mut counts = [0u32; 5];
    for ino in &meta.inodes {
        let mode = *meta.modes.get(ino.mode_index as usize).ok_or_else(|| {
            MetadataError::Inconsistency("legacy inode mode index out of range".into())
        })?;
        counts[InodeRank::from_mode(mode) as usize] += 1;
    }
    let [dirs, symlinks, old_regs, _devices, _others] = counts;
    let file_offset = dirs + symlinks;
    let old_device_offset = file_offset + old_regs;

    // Occurrences of each old regular inode.
    let mut occ = vec![0u32; old_regs as usize];
    for e in &entries {
        if (file_offset..old_device_offset).contains(&e.inode_num) {
            occ[(e.inode_num - file_offset) as usize] += 1;
        } else if e.inode_num as usize >= meta.inodes.len() {
            return Err(MetadataError::Inconsistency(format!(
                "legacy entry references inode {} out of range",
                e.inode_num
            )));
        }
    }
    if let Some(orphan) = occ.iter().position(|&c| c == 0) {
        return Err(MetadataError::Inconsistency(format!(
            "legacy regular inode {} has no entry",
            file_offset + orphan as u32
        )));
    }

    // Every legacy chunk list becomes one shared group; file instances of
    // group g occupy consecutive new regular indices.
    let new_regs: u32 = occ.iter().sum();
    let delta = new_regs - old_regs;

    let mut first_new_index = Vec::with_capacity(old_regs as usize);
    let mut shared_files_table = Vec::with_capacity(new_regs as usize);
    let mut next = 0u32;
    for (g, &c) in occ.iter().enumerate() {
        first_new_index.push(next);
        next += c;
        shared_files_table.extend(std::iter::repeat(g as u32).take(c as usize));
    }

    // Rewrite entries, handing out new file inode numbers per occurrence.
    let mut cursor = first_new_index.clone();
    let dir_entries: Vec<DirEntry> = entries
        .iter()
        .map(|e| {
            let inode_num = if (file_offset..old_device_offset).contains(&e.inode_num) {
                let old_ri = (e.inode_num - file_offset) as usize;
                let new_ri = cursor[old_ri];
                cursor[old_ri] += 1;
                file_offset + new_ri
            } else if e.inode_num >= old_device_offset {
                e.inode_num + delta
            } else {
                e.inode_num
            };
            DirEntry {
                name_index: e.name_index,
                inode_num,
            }
        })
        .collect();

    // New inodes table: duplicate regular InodeData per instance, shift the
    // tail partitions.
    let mut inodes = Vec::with_capacity((meta.inodes.len() as u32 + delta) as usize);
    inodes.extend_from_slice(&meta.inodes[..file_offset as usize]);
    for (old_ri, &c) in occ.iter().enumerate() {
        for _ in 0..c {
            inodes.push(meta.inodes[file_offset as usize + old_ri]);
        }
    }
    inodes.extend_from_slice(&meta.inodes[old_device_offset as usize..]);

    meta.inodes = inodes;
    meta.dir_entries = Some(dir_entries);
    meta.shared_files_table = shared_files_table;
    meta.options.packed_shared_files_table = false;
    // chunk_table is untouched: one list per legacy inode == one per group,
    // and num_unique becomes zero.

    Ok(meta)
}
