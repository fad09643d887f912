//! Read-only view over unpacked metadata.
//!
//! [`MetadataView`] consumes a [`Metadata`] value, performs the legacy
//! upgrade when needed, unpacks any packed tables, derives the partition
//! boundaries and link counts, and then serves every metadata query the
//! reader façade needs: O(1) inode access, path lookup via per-directory
//! binary search, readdir with synthetic dot entries, chunk ranges honoring
//! the shared-files table, and pre-order / data-order walks.
//!
//! # Directory encoding
//!
//! `directories[d].self_entry` is the index of the `dir_entry` naming `d`;
//! `parent_entry` is the `self_entry` of `d`'s parent.  The root directory
//! is inode 0 with `self_entry == parent_entry == 0`, and `dir_entries[0]`
//! is its synthetic self-entry.  With packed directories only the
//! `first_entry` chain is stored; both other fields are rebuilt here.

use super::builder::upgrade_from_v2_2;
use super::{
    Chunk, InodeRank, Metadata, MetadataError, MAX_PACKED_NAME_LEN, MAX_PACKED_SYMLINK_LEN,
};

// ── FileStat ─────────────────────────────────────────────────────────────────

/// POSIX-shaped attributes for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// One entry yielded by [`MetadataView::walk`].
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: String,
    pub inode_num: u32,
    pub depth: usize,
}

// ── MetadataView ─────────────────────────────────────────────────────────────

pub struct MetadataView {
    meta: Metadata,
    // partition boundaries (inode number of the first inode of each rank)
    symlink_offset: u32,
    file_offset: u32,
    device_offset: u32,
    other_offset: u32,
    inode_count: u32,
    /// Unique chunk lists among regular files; regular inodes at
    /// `file_offset + i` with `i < num_unique` own chunk list `i`.
    num_unique: u32,
    nlink: Vec<u32>,
}

impl MetadataView {
    /// Unpack, upgrade, and (optionally) fully validate `meta`.
    ///
    /// Structural properties the view itself relies on are always checked;
    /// `check_consistency` adds the full §invariant sweep and is what the
    /// reader's `check_metadata` option toggles.
    pub fn new(mut meta: Metadata, check_consistency: bool) -> Result<Self, MetadataError> {
        if meta.entry_table_v2_2.is_some() {
            meta = upgrade_from_v2_2(meta)?;
        }

        if check_consistency {
            check_packed_tables(&meta)?;
        }

        unpack_chunk_table(&mut meta)?;
        unpack_shared_files(&mut meta)?;
        meta.names.unpack_index();
        meta.symlinks.unpack_index();

        let partitions = compute_partitions(&meta)?;
        let [dir_count, symlink_count, reg_count, device_count, other_count] = partitions;
        let inode_count = meta.inodes.len() as u32;

        if meta.directories.len() as u32 != dir_count + 1 {
            return Err(MetadataError::Inconsistency(format!(
                "directories table has {} entries for {} directories",
                meta.directories.len(),
                dir_count
            )));
        }

        if meta.options.packed_directories {
            rebuild_directories(&mut meta)?;
        }

        let num_chunk_lists = (meta.chunk_table.len().saturating_sub(1)) as u32;
        let num_shared = meta.shared_files_table.len() as u32;
        let num_groups = meta
            .shared_files_table
            .last()
            .map(|&g| g + 1)
            .unwrap_or(0);
        let num_unique = num_chunk_lists
            .checked_sub(num_groups)
            .ok_or_else(|| {
                MetadataError::Inconsistency(format!(
                    "{num_chunk_lists} chunk lists < {num_groups} shared groups"
                ))
            })?;
        if reg_count != num_unique + num_shared {
            return Err(MetadataError::Inconsistency(format!(
                "regular file count mismatch: {reg_count} != {num_unique} unique + {num_shared} shared"
            )));
        }

        let mut view = MetadataView {
            symlink_offset: dir_count,
            file_offset: dir_count + symlink_count,
            device_offset: dir_count + symlink_count + reg_count,
            other_offset: dir_count + symlink_count + reg_count + device_count,
            inode_count,
            num_unique,
            nlink: Vec::new(),
            meta,
        };
        let _ = other_count;

        view.compute_nlink()?;

        if check_consistency {
            view.check_consistency()?;
        }

        Ok(view)
    }

    // ── Basic accessors ──────────────────────────────────────────────────────

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn block_size(&self) -> u32 {
        self.meta.block_size
    }

    pub fn total_fs_size(&self) -> u64 {
        self.meta.total_fs_size
    }

    pub fn inode_count(&self) -> u32 {
        self.inode_count
    }

    pub fn dir_count(&self) -> u32 {
        self.symlink_offset
    }

    pub fn num_unique_files(&self) -> u32 {
        self.num_unique
    }

    pub fn preferred_path_separator(&self) -> char {
        self.meta
            .preferred_path_separator
            .and_then(char::from_u32)
            .unwrap_or('/')
    }

    fn dir_entries(&self) -> &[super::DirEntry] {
        self.meta
            .dir_entries
            .as_deref()
            .expect("view is always in modern form")
    }

    pub fn root(&self) -> InodeView<'_> {
        InodeView { view: self, num: 0 }
    }

    pub fn inode(&self, num: u32) -> Result<InodeView<'_>, MetadataError> {
        if num >= self.inode_count {
            return Err(MetadataError::IndexOutOfRange(format!(
                "inode {num} >= {}",
                self.inode_count
            )));
        }
        Ok(InodeView { view: self, num })
    }

    pub fn rank_of(&self, num: u32) -> InodeRank {
        if num < self.symlink_offset {
            InodeRank::Directory
        } else if num < self.file_offset {
            InodeRank::Symlink
        } else if num < self.device_offset {
            InodeRank::Regular
        } else if num < self.other_offset {
            InodeRank::Device
        } else {
            InodeRank::Other
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    /// Look up `name` in directory `dir` by binary search over its entries
    /// (sorted by name).
    pub fn find_entry(&self, dir: InodeView<'_>, name: &[u8]) -> Option<InodeView<'_>> {
        if !dir.is_directory() {
            return None;
        }
        let (first, end) = self.entry_range(dir.num);
        let entries = &self.dir_entries()[first..end];
        let idx = entries
            .binary_search_by(|e| {
                self.meta
                    .names
                    .get(e.name_index)
                    .unwrap_or(b"")
                    .cmp(name)
            })
            .ok()?;
        Some(InodeView {
            view: self,
            num: entries[idx].inode_num,
        })
    }

    /// Resolve a path relative to the root.  Both the preferred separator
    /// and `/` are accepted; empty and `/` resolve to the root itself.
    pub fn find_path(&self, path: &str) -> Option<InodeView<'_>> {
        let sep = self.preferred_path_separator();
        let mut iv = self.root();
        for comp in path.split(|c| c == sep || c == '/') {
            if comp.is_empty() {
                continue;
            }
            iv = self.find_entry(iv, comp.as_bytes())?;
        }
        Some(iv)
    }

    /// Entry range `[first, end)` of a directory inode in `dir_entries`.
    fn entry_range(&self, dir_inode: u32) -> (usize, usize) {
        let d = &self.meta.directories[dir_inode as usize];
        let next = &self.meta.directories[dir_inode as usize + 1];
        (d.first_entry as usize, next.first_entry as usize)
    }

    pub fn dir_entry_count(&self, dir: InodeView<'_>) -> usize {
        let (first, end) = self.entry_range(dir.num);
        end - first
    }

    /// Read one directory entry.  Offsets 0 and 1 yield the synthetic `.`
    /// and `..`; `None` past the end.
    pub fn readdir<'a>(
        &'a self,
        dir: InodeView<'a>,
        offset: usize,
    ) -> Option<(InodeView<'a>, Vec<u8>)> {
        if !dir.is_directory() {
            return None;
        }
        match offset {
            0 => Some((dir, b".".to_vec())),
            1 => Some((dir.parent(), b"..".to_vec())),
            _ => {
                let (first, end) = self.entry_range(dir.num);
                let idx = first + (offset - 2);
                if idx >= end {
                    return None;
                }
                let e = &self.dir_entries()[idx];
                let name = self.meta.names.get(e.name_index).ok()?.to_vec();
                Some((
                    InodeView {
                        view: self,
                        num: e.inode_num,
                    },
                    name,
                ))
            }
        }
    }

    // ── Chunks and sizes ─────────────────────────────────────────────────────

    /// Index of the chunk list owned by regular inode `num`, resolving the
    /// shared-files table.
    fn chunk_list_index(&self, num: u32) -> Result<u32, MetadataError> {
        debug_assert_eq!(self.rank_of(num), InodeRank::Regular);
        let ri = num - self.file_offset;
        if ri < self.num_unique {
            Ok(ri)
        } else {
            let si = (ri - self.num_unique) as usize;
            let group = self.meta.shared_files_table[si];
            Ok(self.num_unique + group)
        }
    }

    /// Index of a regular inode within the regular partition.
    pub fn regular_index(&self, num: u32) -> Option<u32> {
        (self.rank_of(num) == InodeRank::Regular).then(|| num - self.file_offset)
    }

    /// Content-object index of a regular inode (its chunk-list number).
    pub fn object_index(&self, num: u32) -> Result<u32, MetadataError> {
        if self.rank_of(num) != InodeRank::Regular {
            return Err(MetadataError::IndexOutOfRange(format!(
                "inode {num} is not a regular file"
            )));
        }
        self.chunk_list_index(num)
    }

    /// Number of distinct chunk lists (content objects).
    pub fn num_objects(&self) -> u32 {
        (self.meta.chunk_table.len().saturating_sub(1)) as u32
    }

    /// Chunk list of content object `object`.
    pub fn object_chunks(&self, object: u32) -> Result<&[Chunk], MetadataError> {
        if object >= self.num_objects() {
            return Err(MetadataError::IndexOutOfRange(format!(
                "object {object} >= {}",
                self.num_objects()
            )));
        }
        let begin = self.meta.chunk_table[object as usize] as usize;
        let end = self.meta.chunk_table[object as usize + 1] as usize;
        Ok(&self.meta.chunks[begin..end])
    }

    /// The chunk list of a regular inode.
    pub fn chunks(&self, num: u32) -> Result<&[Chunk], MetadataError> {
        if self.rank_of(num) != InodeRank::Regular {
            return Err(MetadataError::IndexOutOfRange(format!(
                "inode {num} is not a regular file"
            )));
        }
        let cli = self.chunk_list_index(num)? as usize;
        let begin = self.meta.chunk_table[cli] as usize;
        let end = self.meta.chunk_table[cli + 1] as usize;
        Ok(&self.meta.chunks[begin..end])
    }

    pub fn file_size(&self, num: u32) -> Result<u64, MetadataError> {
        if let Some(sc) = &self.meta.reg_file_size_cache {
            if let Some(&size) = sc.entries.get(&num) {
                return Ok(size);
            }
        }
        Ok(self.chunks(num)?.iter().map(|c| u64::from(c.size)).sum())
    }

    pub fn symlink_target(&self, num: u32) -> Result<&[u8], MetadataError> {
        if self.rank_of(num) != InodeRank::Symlink {
            return Err(MetadataError::IndexOutOfRange(format!(
                "inode {num} is not a symlink"
            )));
        }
        let si = (num - self.symlink_offset) as usize;
        let str_index = *self.meta.symlink_table.get(si).ok_or_else(|| {
            MetadataError::Inconsistency(format!("symlink_table missing entry {si}"))
        })?;
        self.meta.symlinks.get(str_index)
    }

    // ── getattr ──────────────────────────────────────────────────────────────

    pub fn getattr(&self, iv: InodeView<'_>) -> Result<FileStat, MetadataError> {
        let data = &self.meta.inodes[iv.num as usize];
        let mode = *self.meta.modes.get(data.mode_index as usize).ok_or_else(|| {
            MetadataError::IndexOutOfRange(format!("mode index {}", data.mode_index))
        })?;

        // Legacy "set-owner" form: with an empty interning table the index
        // itself is the id.
        let uid = if self.meta.uids.is_empty() {
            data.owner_index
        } else {
            *self.meta.uids.get(data.owner_index as usize).ok_or_else(|| {
                MetadataError::IndexOutOfRange(format!("uid index {}", data.owner_index))
            })?
        };
        let gid = if self.meta.gids.is_empty() {
            data.group_index
        } else {
            *self.meta.gids.get(data.group_index as usize).ok_or_else(|| {
                MetadataError::IndexOutOfRange(format!("gid index {}", data.group_index))
            })?
        };

        let res = u64::from(self.meta.options.time_resolution_sec.max(1));
        let base = self.meta.timestamp_base;
        let mtime = base + u64::from(data.mtime_offset) * res;
        let (atime, ctime) = if self.meta.options.mtime_only {
            (mtime, mtime)
        } else {
            (
                base + u64::from(data.atime_offset) * res,
                base + u64::from(data.ctime_offset) * res,
            )
        };

        let size = match self.rank_of(iv.num) {
            InodeRank::Regular => self.file_size(iv.num)?,
            InodeRank::Symlink => self.symlink_target(iv.num)?.len() as u64,
            _ => 0,
        };

        let rdev = if self.rank_of(iv.num) == InodeRank::Device {
            let di = (iv.num - self.device_offset) as usize;
            self.meta.devices.get(di).copied().unwrap_or(0)
        } else {
            0
        };

        Ok(FileStat {
            ino: iv.num,
            mode,
            nlink: self.nlink[iv.num as usize],
            uid,
            gid,
            size,
            rdev,
            atime,
            mtime,
            ctime,
        })
    }

    // ── Walks ────────────────────────────────────────────────────────────────

    /// Pre-order walk; the root is visited first with an empty path.
    pub fn walk<F: FnMut(&WalkEntry)>(&self, mut cb: F) {
        let root = WalkEntry {
            path: String::new(),
            inode_num: 0,
            depth: 0,
        };
        cb(&root);
        self.walk_dir(0, "", 1, &mut cb);
    }

    fn walk_dir<F: FnMut(&WalkEntry)>(&self, dir: u32, prefix: &str, depth: usize, cb: &mut F) {
        let (first, end) = self.entry_range(dir);
        for idx in first..end {
            let e = &self.dir_entries()[idx];
            let name = String::from_utf8_lossy(self.meta.names.get(e.name_index).unwrap_or(b""));
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}/{name}")
            };
            let entry = WalkEntry {
                path: path.clone(),
                inode_num: e.inode_num,
                depth,
            };
            cb(&entry);
            if self.rank_of(e.inode_num) == InodeRank::Directory {
                self.walk_dir(e.inode_num, &path, depth + 1, cb);
            }
        }
    }

    /// Walk ordered by data placement: non-regular entries keep pre-order
    /// and come first, regular files follow ordered by the image position
    /// of their first chunk.
    pub fn walk_data_order<F: FnMut(&WalkEntry)>(&self, mut cb: F) {
        let mut entries = Vec::new();
        self.walk(|e| entries.push(e.clone()));

        let mut files: Vec<WalkEntry> = Vec::new();
        let mut rest: Vec<WalkEntry> = Vec::new();
        for e in entries {
            if self.rank_of(e.inode_num) == InodeRank::Regular {
                files.push(e);
            } else {
                rest.push(e);
            }
        }
        files.sort_by_key(|e| {
            self.chunks(e.inode_num)
                .ok()
                .and_then(|c| c.first())
                .map(|c| (c.block, c.offset))
                .unwrap_or((u32::MAX, u32::MAX))
        });

        for e in rest.iter().chain(files.iter()) {
            cb(e);
        }
    }

    // ── Derived state ────────────────────────────────────────────────────────

    fn compute_nlink(&mut self) -> Result<(), MetadataError> {
        let mut nlink = vec![0u32; self.inode_count as usize];
        for (i, e) in self.dir_entries().iter().enumerate() {
            if e.inode_num >= self.inode_count {
                return Err(MetadataError::Inconsistency(format!(
                    "dir_entries[{i}] references inode {} >= {}",
                    e.inode_num, self.inode_count
                )));
            }
            nlink[e.inode_num as usize] += 1;
        }
        // Directories follow the `.`/`..` convention: 2 plus one per child
        // directory.
        for d in 0..self.symlink_offset {
            let (first, end) = self.entry_range(d);
            let child_dirs = self.dir_entries()[first..end]
                .iter()
                .filter(|e| e.inode_num < self.symlink_offset)
                .count() as u32;
            nlink[d as usize] = 2 + child_dirs;
        }
        self.nlink = nlink;
        Ok(())
    }

    // ── Consistency ──────────────────────────────────────────────────────────

    /// The full invariant sweep over the (already unpacked) tables.
    pub fn check_consistency(&self) -> Result<(), MetadataError> {
        let m = &self.meta;

        if !m.block_size.is_power_of_two() {
            return Err(MetadataError::Inconsistency(format!(
                "block size {} is not a power of two",
                m.block_size
            )));
        }

        // rank partitioning is monotonic
        let mut last_rank = InodeRank::Directory;
        for (i, ino) in m.inodes.iter().enumerate() {
            let mode = *m.modes.get(ino.mode_index as usize).ok_or_else(|| {
                MetadataError::Inconsistency(format!("inode {i}: mode index out of range"))
            })?;
            let rank = InodeRank::from_mode(mode);
            if rank < last_rank {
                return Err(MetadataError::Inconsistency(format!(
                    "inode partitioning violated at inode {i}"
                )));
            }
            last_rank = rank;
            if !m.uids.is_empty() && ino.owner_index as usize >= m.uids.len() {
                return Err(MetadataError::Inconsistency(format!(
                    "inode {i}: uid index out of range"
                )));
            }
            if !m.gids.is_empty() && ino.group_index as usize >= m.gids.len() {
                return Err(MetadataError::Inconsistency(format!(
                    "inode {i}: gid index out of range"
                )));
            }
        }

        // directories: monotone first_entry, consistent parent/self
        let entries = self.dir_entries();
        for w in m.directories.windows(2) {
            if w[0].first_entry > w[1].first_entry {
                return Err(MetadataError::Inconsistency(
                    "directories.first_entry not monotone".into(),
                ));
            }
        }
        if m.directories.last().map(|d| d.first_entry as usize) != Some(entries.len()) {
            return Err(MetadataError::Inconsistency(
                "directories sentinel does not close dir_entries".into(),
            ));
        }
        for d in 0..self.symlink_offset {
            let dir = &m.directories[d as usize];
            let se = dir.self_entry as usize;
            if se >= entries.len() || entries[se].inode_num != d {
                return Err(MetadataError::Inconsistency(format!(
                    "directory {d}: self_entry {se} does not point back"
                )));
            }
            if dir.parent_entry as usize >= entries.len() {
                return Err(MetadataError::Inconsistency(format!(
                    "directory {d}: parent_entry out of range"
                )));
            }
        }

        // entries: names in range and sorted per directory
        for d in 0..self.symlink_offset {
            let (first, end) = self.entry_range(d);
            let mut prev: Option<&[u8]> = None;
            for e in &entries[first..end] {
                let name = m.names.get(e.name_index)?;
                if let Some(p) = prev {
                    if p >= name {
                        return Err(MetadataError::Inconsistency(format!(
                            "directory {d}: entries not sorted by name"
                        )));
                    }
                }
                prev = Some(name);
            }
        }

        // chunks against block size
        for (i, c) in m.chunks.iter().enumerate() {
            if c.offset >= m.block_size || c.offset as u64 + c.size as u64 > m.block_size as u64 {
                return Err(MetadataError::Inconsistency(format!(
                    "chunk {i} exceeds block size: offset={} size={}",
                    c.offset, c.size
                )));
            }
        }

        // chunk table: non-decreasing, closed by |chunks|
        if !m.chunk_table.windows(2).all(|w| w[0] <= w[1]) {
            return Err(MetadataError::Inconsistency("chunk_table not sorted".into()));
        }
        if m.chunk_table.last().copied().unwrap_or(0) as usize != m.chunks.len() {
            return Err(MetadataError::Inconsistency(
                "chunk_table sentinel != |chunks|".into(),
            ));
        }

        // shared files table: monotone, dense groups
        let mut prev = 0u32;
        for (i, &g) in m.shared_files_table.iter().enumerate() {
            if g < prev || g > prev + 1 || (i == 0 && g != 0) {
                return Err(MetadataError::Inconsistency(
                    "shared_files_table is not a dense monotone sequence".into(),
                ));
            }
            prev = g;
        }

        // string tables (already unpacked; check plain form)
        m.names.check("names", u32::MAX)?;
        m.symlinks.check("symlinks", u32::MAX)?;

        // symlink table
        if m.symlink_table.len() as u32 != self.file_offset - self.symlink_offset {
            return Err(MetadataError::Inconsistency(format!(
                "symlink_table has {} entries for {} symlinks",
                m.symlink_table.len(),
                self.file_offset - self.symlink_offset
            )));
        }
        for &si in &m.symlink_table {
            if si as usize >= m.symlinks.len() {
                return Err(MetadataError::Inconsistency(format!(
                    "symlink string index {si} out of range"
                )));
            }
        }

        // categories
        for &c in &m.block_categories {
            if c as usize >= m.category_names.len() {
                return Err(MetadataError::Inconsistency(format!(
                    "block category {c} out of range"
                )));
            }
        }
        for (&block, &mdix) in &m.block_category_metadata {
            if mdix as usize >= m.category_metadata_json.len() {
                return Err(MetadataError::Inconsistency(format!(
                    "block {block}: category metadata index {mdix} out of range"
                )));
            }
        }

        // size cache points at regular inodes
        if let Some(sc) = &m.reg_file_size_cache {
            for &ino in sc.entries.keys() {
                if self.rank_of(ino) != InodeRank::Regular {
                    return Err(MetadataError::Inconsistency(format!(
                        "size cache entry for non-regular inode {ino}"
                    )));
                }
            }
        }

        Ok(())
    }
}

// ── Unpacking helpers ────────────────────────────────────────────────────────

fn unpack_chunk_table(meta: &mut Metadata) -> Result<(), MetadataError> {
    if !meta.options.packed_chunk_table {
        return Ok(());
    }
    let mut acc = 0u64;
    for v in meta.chunk_table.iter_mut() {
        acc += u64::from(*v);
        *v = u32::try_from(acc)
            .map_err(|_| MetadataError::Inconsistency("packed chunk_table overflow".into()))?;
    }
    if meta.chunk_table.last().copied().unwrap_or(0) as usize != meta.chunks.len() {
        return Err(MetadataError::Inconsistency(
            "packed chunk_table does not sum to |chunks|".into(),
        ));
    }
    meta.options.packed_chunk_table = false;
    Ok(())
}

fn unpack_shared_files(meta: &mut Metadata) -> Result<(), MetadataError> {
    if !meta.options.packed_shared_files_table {
        return Ok(());
    }
    // Packed form: one member count per group.  Single-member groups are
    // legal (a rebuilt legacy image routes every file through the shared
    // table); an empty group would break the dense group numbering.
    let mut expanded = Vec::new();
    for (group, &count) in meta.shared_files_table.iter().enumerate() {
        if count == 0 {
            return Err(MetadataError::Inconsistency(format!(
                "shared files group {group} is empty"
            )));
        }
        expanded.extend(std::iter::repeat(group as u32).take(count as usize));
    }
    meta.shared_files_table = expanded;
    meta.options.packed_shared_files_table = false;
    Ok(())
}

fn check_packed_tables(meta: &Metadata) -> Result<(), MetadataError> {
    if meta.options.packed_names_index {
        meta.names.check("names", MAX_PACKED_NAME_LEN)?;
    }
    if meta.options.packed_symlinks_index {
        meta.symlinks.check("symlinks", MAX_PACKED_SYMLINK_LEN)?;
    }
    Ok(())
}

/// Rebuild `parent_entry`/`self_entry` after loading packed directories.
/// Requires directory inodes to be numbered parent-before-child, which the
/// builder guarantees (pre-order assignment).
fn rebuild_directories(meta: &mut Metadata) -> Result<(), MetadataError> {
    let entries = meta
        .dir_entries
        .as_ref()
        .ok_or_else(|| MetadataError::Inconsistency("packed directories without entries".into()))?
        .clone();
    let dir_count = meta.directories.len() - 1;

    meta.directories[0].parent_entry = 0;
    meta.directories[0].self_entry = 0;

    for d in 0..dir_count {
        let first = meta.directories[d].first_entry as usize;
        let end = meta.directories[d + 1].first_entry as usize;
        let self_entry = meta.directories[d].self_entry;
        for (idx, e) in entries.iter().enumerate().take(end).skip(first) {
            let child = e.inode_num as usize;
            if child < dir_count && child != 0 {
                if child <= d {
                    return Err(MetadataError::Inconsistency(format!(
                        "directory {child} appears as child of later directory {d}"
                    )));
                }
                meta.directories[child].self_entry = idx as u32;
                meta.directories[child].parent_entry = self_entry;
            }
        }
    }
    meta.options.packed_directories = false;
    Ok(())
}

fn compute_partitions(meta: &Metadata) -> Result<[u32; 5], MetadataError> {
    let mut counts = [0u32; 5];
    let mut last_rank = InodeRank::Directory;
    for (i, ino) in meta.inodes.iter().enumerate() {
        let mode = *meta.modes.get(ino.mode_index as usize).ok_or_else(|| {
            MetadataError::Inconsistency(format!("inode {i}: mode index out of range"))
        })?;
        let rank = InodeRank::from_mode(mode);
        if rank < last_rank {
            return Err(MetadataError::Inconsistency(format!(
                "inode partitioning violated at inode {i}"
            )));
        }
        last_rank = rank;
        counts[rank as usize] += 1;
    }
    Ok(counts)
}

// ── InodeView ────────────────────────────────────────────────────────────────

/// A lightweight handle to one inode.
#[derive(Clone, Copy)]
pub struct InodeView<'a> {
    view: &'a MetadataView,
    num: u32,
}

impl<'a> InodeView<'a> {
    pub fn num(self) -> u32 {
        self.num
    }

    pub fn rank(self) -> InodeRank {
        self.view.rank_of(self.num)
    }

    pub fn is_directory(self) -> bool {
        self.rank() == InodeRank::Directory
    }

    pub fn is_symlink(self) -> bool {
        self.rank() == InodeRank::Symlink
    }

    pub fn is_regular(self) -> bool {
        self.rank() == InodeRank::Regular
    }

    pub fn mode(self) -> u32 {
        let data = &self.view.meta.inodes[self.num as usize];
        self.view
            .meta
            .modes
            .get(data.mode_index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Parent directory (the root is its own parent).
    pub fn parent(self) -> InodeView<'a> {
        if !self.is_directory() {
            return self;
        }
        let parent_entry = self.view.meta.directories[self.num as usize].parent_entry;
        InodeView {
            view: self.view,
            num: self.view.dir_entries()[parent_entry as usize].inode_num,
        }
    }

    pub fn file_size(self) -> Result<u64, MetadataError> {
        match self.rank() {
            InodeRank::Regular => self.view.file_size(self.num),
            InodeRank::Symlink => Ok(self.view.symlink_target(self.num)?.len() as u64),
            _ => Ok(0),
        }
    }

    pub fn chunks(self) -> Result<&'a [Chunk], MetadataError> {
        self.view.chunks(self.num)
    }
}

impl std::fmt::Debug for InodeView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InodeView({}, {:?})", self.num, self.rank())
    }
}
