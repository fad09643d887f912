//! Writer-side file scanner — two-tier deduplication with deferred inode
//! allocation.
//!
//! The `unique_size` table holds an entry for every `(size, start_hash)`
//! key we discover; the start hash is XXH3-64 over the first 4 KiB and is
//! only computed for files of at least 1 MiB.
//!
//! - The first file of a key is definitely not a duplicate: it gets an
//!   inode immediately and no hashing happens yet.
//! - When the second file of a key arrives, both must be fully hashed.
//!   The first file's hash MUST land in `by_hash` before any subsequent
//!   file looks it up, otherwise a fast subsequent file would wrongly
//!   conclude it is unique.  A per-key latch enforces exactly that order:
//!   the first file's hash job stores its hash and opens the latch;
//!   subsequent files hash concurrently, then wait on the latch before
//!   consulting `by_hash`.
//! - Hardlinks are grouped by raw inode number before any hashing; all
//!   members of a group share the first member's inode.
//!
//! Finalization assigns inode numbers in two passes over sorted keys:
//! unique files first (a contiguous low range), then duplicate groups
//! ordered by reversed path for reproducibility.  Files with identical
//! content share exactly one inode; object numbers equal the inode's index
//! within the regular partition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, trace};

use crate::checksum::{xxh3_64_of, HashAlgorithm};
use crate::os::{HostStat, OsAccess};
use crate::worker::{Latch, WorkerGroup};

/// Files at least this large get a start hash in the tier-1 key.
pub const LARGE_FILE_THRESHOLD: u64 = 1024 * 1024;
/// Prefix length covered by the start hash.
pub const LARGE_FILE_START_HASH_SIZE: usize = 4096;

// ── Progress ─────────────────────────────────────────────────────────────────

/// Shared scan counters; all monotone, safe to read while scanning.
#[derive(Debug, Default)]
pub struct Progress {
    pub files_scanned: AtomicU64,
    pub duplicate_files: AtomicU64,
    pub saved_by_deduplication: AtomicU64,
    pub hardlinks: AtomicU64,
    pub errors: AtomicU64,
    pub original_size: AtomicU64,
}

// ── Scan entities ────────────────────────────────────────────────────────────

/// One regular file encountered by the tree walk.
pub struct ScanFile {
    pub path: PathBuf,
    pub stat: HostStat,
    state: Mutex<FileState>,
}

#[derive(Default)]
struct FileState {
    hash: Option<Vec<u8>>,
    invalid: bool,
    inode: Option<Arc<ScanInode>>,
}

impl ScanFile {
    pub fn new(path: PathBuf, stat: HostStat) -> Arc<Self> {
        Arc::new(ScanFile {
            path,
            stat,
            state: Mutex::new(FileState::default()),
        })
    }

    pub fn size(&self) -> u64 {
        self.stat.size
    }

    /// An unreadable file is stored as an empty file with its own inode.
    pub fn is_invalid(&self) -> bool {
        self.state.lock().unwrap().invalid
    }

    fn set_invalid(&self) {
        self.state.lock().unwrap().invalid = true;
    }

    pub fn hash(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().hash.clone()
    }

    pub fn inode(&self) -> Option<Arc<ScanInode>> {
        self.state.lock().unwrap().inode.clone()
    }

    fn set_inode(&self, inode: Arc<ScanInode>) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.inode.is_none(), "inode assigned twice");
        st.inode = Some(inode);
    }

    /// The inode number within the regular partition (valid after
    /// finalize).
    pub fn inode_num(&self) -> Option<u32> {
        self.inode().and_then(|i| i.num())
    }

    /// Reversed-path ordering key, used for reproducible duplicate
    /// numbering.
    fn revpath_cmp(&self, other: &Self) -> std::cmp::Ordering {
        let a = self.path.as_os_str().as_encoded_bytes();
        let b = other.path.as_os_str().as_encoded_bytes();
        a.iter().rev().cmp(b.iter().rev())
    }
}

/// A writer-side inode: one content object shared by all files with equal
/// bytes (and all their hardlinks).
pub struct ScanInode {
    num: Mutex<Option<u32>>,
    files: Mutex<Vec<Arc<ScanFile>>>,
}

impl ScanInode {
    fn create() -> Arc<Self> {
        Arc::new(ScanInode {
            num: Mutex::new(None),
            files: Mutex::new(Vec::new()),
        })
    }

    /// Inode number within the regular partition == content object number.
    pub fn num(&self) -> Option<u32> {
        *self.num.lock().unwrap()
    }

    /// All files sharing this inode; the first one is the data source.
    pub fn files(&self) -> Vec<Arc<ScanFile>> {
        self.files.lock().unwrap().clone()
    }

    pub fn size(&self) -> u64 {
        self.files
            .lock()
            .unwrap()
            .first()
            .map(|f| if f.is_invalid() { 0 } else { f.size() })
            .unwrap_or(0)
    }
}

// ── Scanner ──────────────────────────────────────────────────────────────────

type FilesVec = Vec<Arc<ScanFile>>;
type SizeKey = (u64, u64);

struct SharedState {
    by_hash: HashMap<Vec<u8>, FilesVec>,
    by_raw_inode: HashMap<u64, FilesVec>,
    first_file_hashed: HashMap<SizeKey, Arc<Latch>>,
    inodes: Vec<Arc<ScanInode>>,
}

struct Shared {
    state: Mutex<SharedState>,
    os: Arc<dyn OsAccess>,
    progress: Arc<Progress>,
    hash_algo: HashAlgorithm,
}

pub struct FileScanner {
    shared: Arc<Shared>,
    wg: Arc<WorkerGroup>,
    // the following are only touched from the scanning thread
    hardlinks: HashMap<u64, FilesVec>,
    unique_size: HashMap<SizeKey, FilesVec>,
    start_hashes: HashMap<usize, u64>,
    num_unique: u32,
}

/// Result of [`FileScanner::finalize`]: inodes ordered by number.
pub struct ScanResult {
    pub inodes: Vec<Arc<ScanInode>>,
    pub num_unique: u32,
}

impl FileScanner {
    pub fn new(
        wg: Arc<WorkerGroup>,
        os: Arc<dyn OsAccess>,
        progress: Arc<Progress>,
        hash_algo: HashAlgorithm,
    ) -> Self {
        FileScanner {
            shared: Arc::new(Shared {
                state: Mutex::new(SharedState {
                    by_hash: HashMap::new(),
                    by_raw_inode: HashMap::new(),
                    first_file_hashed: HashMap::new(),
                    inodes: Vec::new(),
                }),
                os,
                progress,
                hash_algo,
            }),
            wg,
            hardlinks: HashMap::new(),
            unique_size: HashMap::new(),
            start_hashes: HashMap::new(),
            num_unique: 0,
        }
    }

    /// Scan one file.  Must be called from a single thread; hashing work is
    /// dispatched to the worker group.
    pub fn scan(&mut self, file: &Arc<ScanFile>) {
        if file.stat.nlink > 1 {
            let group = self.hardlinks.entry(file.stat.raw_inode).or_default();
            group.push(Arc::clone(file));
            if group.len() > 1 {
                // follower: resolved against the leader at finalize
                self.shared.progress.hardlinks.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .progress
                    .files_scanned
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.shared
            .progress
            .original_size
            .fetch_add(file.size(), Ordering::Relaxed);
        self.shared
            .progress
            .files_scanned
            .fetch_add(1, Ordering::Relaxed);

        if self.shared.hash_algo.is_none() {
            let mut state = self.shared.state.lock().unwrap();
            state
                .by_raw_inode
                .entry(file.stat.raw_inode)
                .or_default()
                .push(Arc::clone(file));
            add_inode(&mut state, file);
            return;
        }

        self.scan_dedupe(file);
    }

    fn scan_dedupe(&mut self, file: &Arc<ScanFile>) {
        let size = file.size();
        let mut start_hash = 0u64;

        trace!("scanning file {} [size={size}]", file.path.display());

        if size >= LARGE_FILE_THRESHOLD {
            match self.shared.os.map_file(&file.path) {
                Ok(view) => {
                    let prefix = &view[..LARGE_FILE_START_HASH_SIZE.min(view.len())];
                    start_hash = xxh3_64_of(prefix);
                }
                Err(e) => {
                    error!(
                        "failed to map file {}: {e}, creating empty file",
                        file.path.display()
                    );
                    self.shared.progress.errors.fetch_add(1, Ordering::Relaxed);
                    file.set_invalid();
                }
            }
            self.start_hashes
                .insert(Arc::as_ptr(file) as usize, start_hash);
        }

        let key: SizeKey = (size, start_hash);

        match self.unique_size.entry(key) {
            std::collections::hash_map::Entry::Vacant(e) => {
                // Never seen this (size, start_hash): definitely no
                // duplicate of anything so far.
                e.insert(vec![Arc::clone(file)]);
                let mut state = self.shared.state.lock().unwrap();
                add_inode(&mut state, file);
            }
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let latch = if e.get().is_empty() {
                    // third or later file of this key; the first file's
                    // hash job may still be running
                    self.shared
                        .state
                        .lock()
                        .unwrap()
                        .first_file_hashed
                        .get(&key)
                        .cloned()
                } else {
                    // second file: both must be hashed now, first one first
                    let first = e.get()[0].clone();
                    e.get_mut().clear();

                    let latch = Latch::new();
                    {
                        let mut state = self.shared.state.lock().unwrap();
                        let prev = state.first_file_hashed.insert(key, Arc::clone(&latch));
                        debug_assert!(prev.is_none(), "latch for key already exists");
                    }

                    let shared = Arc::clone(&self.shared);
                    let first_latch = Arc::clone(&latch);
                    self.wg.add_job(move || {
                        hash_file(&shared, &first);
                        let mut state = shared.state.lock().unwrap();
                        debug_assert!(first.inode().is_some());
                        if first.is_invalid() {
                            state
                                .by_raw_inode
                                .entry(first.stat.raw_inode)
                                .or_default()
                                .push(Arc::clone(&first));
                        } else {
                            let hash = first.hash().expect("hashed above");
                            let slot = state.by_hash.entry(hash).or_default();
                            debug_assert!(slot.is_empty(), "unexpected existing hash");
                            slot.push(Arc::clone(&first));
                        }
                        first_latch.count_down();
                        state.first_file_hashed.remove(&key);
                    });

                    Some(latch)
                };

                // hash this (second or later) file concurrently, then look
                // up the published hash
                let shared = Arc::clone(&self.shared);
                let file = Arc::clone(file);
                self.wg.add_job(move || {
                    hash_file(&shared, &file);
                    if let Some(latch) = &latch {
                        latch.wait();
                    }
                    let mut state = shared.state.lock().unwrap();
                    if file.is_invalid() {
                        add_inode(&mut state, &file);
                        state
                            .by_raw_inode
                            .entry(file.stat.raw_inode)
                            .or_default()
                            .push(Arc::clone(&file));
                    } else {
                        let hash = file.hash().expect("hashed above");
                        let is_empty = state.by_hash.entry(hash.clone()).or_default().is_empty();
                        if is_empty {
                            // not a duplicate after all
                            add_inode(&mut state, &file);
                        } else {
                            let inode = state.by_hash.get(&hash).unwrap()[0]
                                .inode()
                                .expect("first file has an inode");
                            file.set_inode(inode);
                            shared
                                .progress
                                .duplicate_files
                                .fetch_add(1, Ordering::Relaxed);
                            shared
                                .progress
                                .saved_by_deduplication
                                .fetch_add(file.size(), Ordering::Relaxed);
                        }
                        state.by_hash.get_mut(&hash).unwrap().push(Arc::clone(&file));
                    }
                });
            }
        }
    }

    /// Wait for hashing, resolve hardlinks, and assign inode numbers.
    pub fn finalize(mut self) -> ScanResult {
        self.wg.wait_idle();

        let hash_algo = self.shared.hash_algo;
        let mut state_guard = self.shared.state.lock().unwrap();
        let state = &mut *state_guard;
        debug_assert!(state.first_file_hashed.is_empty());

        // hardlink groups attach to wherever their leader ended up
        let hardlinks = std::mem::take(&mut self.hardlinks);
        for (_, group) in hardlinks {
            if group.len() < 2 {
                continue;
            }
            let leader = &group[0];
            let inode = leader.inode().expect("leader was scanned");
            let fv = if hash_algo.is_none() {
                state
                    .by_raw_inode
                    .get_mut(&leader.stat.raw_inode)
                    .expect("leader registered by raw inode")
            } else if let Some(hash) = leader.hash() {
                state
                    .by_hash
                    .get_mut(&hash)
                    .expect("hashed leader is in by_hash")
            } else if leader.is_invalid() {
                state
                    .by_raw_inode
                    .entry(leader.stat.raw_inode)
                    .or_default()
            } else {
                // never hashed: still sitting in its unique_size entry
                let start = self
                    .start_hashes
                    .get(&(Arc::as_ptr(leader) as usize))
                    .copied()
                    .unwrap_or(0);
                self.unique_size
                    .get_mut(&(leader.size(), start))
                    .expect("unhashed leader is in unique_size")
            };
            for follower in &group[1..] {
                follower.set_inode(Arc::clone(&inode));
                fv.push(Arc::clone(follower));
            }
        }

        let mut inode_num = 0u32;
        let mut num_unique = 0u32;

        if hash_algo.is_none() {
            let by_raw = std::mem::take(&mut state.by_raw_inode);
            finalize_files(by_raw, &mut inode_num, &mut num_unique, false);
        } else {
            let unique = std::mem::take(&mut self.unique_size);
            finalize_files(unique, &mut inode_num, &mut num_unique, true);
            let by_raw = std::mem::take(&mut state.by_raw_inode);
            finalize_files(by_raw, &mut inode_num, &mut num_unique, false);
            let by_hash = std::mem::take(&mut state.by_hash);
            finalize_files(by_hash, &mut inode_num, &mut num_unique, false);
        }

        self.num_unique = num_unique;

        let mut inodes: Vec<Arc<ScanInode>> = state
            .inodes
            .iter()
            .filter(|i| i.num().is_some())
            .cloned()
            .collect();
        inodes.sort_by_key(|i| i.num().unwrap());
        debug_assert_eq!(inodes.len(), inode_num as usize);

        ScanResult {
            inodes,
            num_unique,
        }
    }

    pub fn num_unique(&self) -> u32 {
        self.num_unique
    }
}

fn add_inode(state: &mut SharedState, file: &Arc<ScanFile>) {
    debug_assert!(file.inode().is_none());
    let inode = ScanInode::create();
    file.set_inode(Arc::clone(&inode));
    state.inodes.push(inode);
}

fn hash_file(shared: &Shared, file: &Arc<ScanFile>) {
    if file.is_invalid() {
        return;
    }
    let data = if file.size() > 0 {
        match shared.os.map_file(&file.path) {
            Ok(view) => view,
            Err(e) => {
                error!(
                    "failed to map file {}: {e}, creating empty file",
                    file.path.display()
                );
                shared.progress.errors.fetch_add(1, Ordering::Relaxed);
                file.set_invalid();
                return;
            }
        }
    } else {
        crate::image::ImageData::from_vec(Vec::new())
    };
    let hash = shared.hash_algo.digest(&data);
    file.state.lock().unwrap().hash = Some(hash);
}

/// Assign inode numbers over one map: unique entries first, then duplicate
/// groups ordered by reversed path.
fn finalize_files<K: Ord>(
    map: HashMap<K, FilesVec>,
    inode_num: &mut u32,
    num_unique: &mut u32,
    unique_only: bool,
) {
    let mut entries: Vec<(K, FilesVec)> =
        map.into_iter().filter(|(_, fv)| !fv.is_empty()).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    // unique pass: the entry is a single hardlink family, not a duplicate
    // group spanning several source inodes
    let mut leftover: Vec<FilesVec> = Vec::new();
    for (_, files) in entries {
        let single_family = files
            .iter()
            .all(|f| f.stat.raw_inode == files[0].stat.raw_inode);
        if single_family {
            assign_inode(&files, inode_num);
            *num_unique += 1;
        } else {
            debug_assert!(!unique_only, "unique-only map holds a duplicate group");
            leftover.push(files);
        }
    }

    // duplicate pass, ordered by reversed path for reproducibility
    for mut files in leftover {
        files.sort_by(|a, b| a.revpath_cmp(b));
        assign_inode(&files, inode_num);
    }
}

fn assign_inode(files: &FilesVec, inode_num: &mut u32) {
    // distinct inode objects can share one entry (e.g. grouped by raw
    // inode with hashing disabled)
    for f in files {
        let inode = f.inode().expect("scanned file has an inode");
        let mut num = inode.num.lock().unwrap();
        if num.is_none() {
            *num = Some(*inode_num);
            *inode_num += 1;
        }
        drop(num);
        let mut members = inode.files.lock().unwrap();
        if !members.iter().any(|m| Arc::ptr_eq(m, f)) {
            members.push(Arc::clone(f));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::RealOs;
    use std::io::Write;

    fn write_file(dir: &std::path::Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    fn scan_paths(paths: &[PathBuf], hash_algo: HashAlgorithm) -> (ScanResult, Vec<Arc<ScanFile>>) {
        let os: Arc<dyn OsAccess> = Arc::new(RealOs);
        let wg = Arc::new(WorkerGroup::new("scanner-test", 4));
        let progress = Arc::new(Progress::default());
        let mut scanner = FileScanner::new(wg, Arc::clone(&os), progress, hash_algo);

        let files: Vec<Arc<ScanFile>> = paths
            .iter()
            .map(|p| ScanFile::new(p.clone(), os.stat(p).unwrap()))
            .collect();
        for f in &files {
            scanner.scan(f);
        }
        (scanner.finalize(), files)
    }

    #[test]
    fn identical_files_share_one_inode() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0xAAu8; 8192];
        let paths = vec![
            write_file(dir.path(), "a", &payload),
            write_file(dir.path(), "b", &payload),
            write_file(dir.path(), "c", b"different"),
        ];

        let (result, files) = scan_paths(&paths, HashAlgorithm::Blake3);
        assert_eq!(result.inodes.len(), 2);
        assert_eq!(files[0].inode_num(), files[1].inode_num());
        assert_ne!(files[0].inode_num(), files[2].inode_num());
    }

    #[test]
    fn no_hash_disables_content_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0x42u8; 1024];
        let paths = vec![
            write_file(dir.path(), "a", &payload),
            write_file(dir.path(), "b", &payload),
        ];

        let (result, files) = scan_paths(&paths, HashAlgorithm::None);
        assert_eq!(result.inodes.len(), 2);
        assert_ne!(files[0].inode_num(), files[1].inode_num());
    }

    #[cfg(unix)]
    #[test]
    fn hardlinks_always_share_an_inode() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a", b"linked content");
        let link = dir.path().join("link");
        std::fs::hard_link(&a, &link).unwrap();
        let other = write_file(dir.path(), "other", b"something else");

        for algo in [HashAlgorithm::Blake3, HashAlgorithm::None] {
            let (result, files) =
                scan_paths(&[a.clone(), link.clone(), other.clone()], algo);
            assert_eq!(result.inodes.len(), 2, "algo {}", algo.name());
            assert_eq!(files[0].inode_num(), files[1].inode_num());
            assert_ne!(files[0].inode_num(), files[2].inode_num());
        }
    }

    #[cfg(unix)]
    #[test]
    fn hardlink_and_duplicate_collapse_together() {
        // the S2 shape: a/file and b/file identical, c/link hardlinked to
        // a/file — exactly one inode for all three
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0xAAu8; 1 << 20];
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::create_dir_all(dir.path().join("c")).unwrap();
        let fa = write_file(&dir.path().join("a"), "file", &payload);
        let fb = write_file(&dir.path().join("b"), "file", &payload);
        let fl = dir.path().join("c/link");
        std::fs::hard_link(&fa, &fl).unwrap();

        let (result, files) = scan_paths(&[fa, fb, fl], HashAlgorithm::Blake3);
        assert_eq!(result.inodes.len(), 1);
        let num = files[0].inode_num();
        assert!(files.iter().all(|f| f.inode_num() == num));
        assert_eq!(result.inodes[0].files().len(), 3);
    }

    #[test]
    fn unique_prefix_before_duplicate_groups() {
        let dir = tempfile::tempdir().unwrap();
        let dup = vec![7u8; 4096];
        let paths = vec![
            write_file(dir.path(), "zz-dup1", &dup),
            write_file(dir.path(), "aa-dup2", &dup),
            write_file(dir.path(), "unique1", b"one"),
            write_file(dir.path(), "unique2", b"four"),
        ];

        let (result, files) = scan_paths(&paths, HashAlgorithm::Blake3);
        assert_eq!(result.inodes.len(), 3);
        assert_eq!(result.num_unique, 2);
        // duplicates come after the unique range
        let dup_num = files[0].inode_num().unwrap();
        assert_eq!(files[1].inode_num().unwrap(), dup_num);
        assert_eq!(dup_num, 2);
    }

    #[test]
    fn unreadable_files_become_empty_with_own_inode() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "ghost", b"soon gone");
        let mut stat = RealOs.stat(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        // pretend it is large enough to need a start hash, so mapping
        // fails during scan already
        stat.size = 2 * LARGE_FILE_THRESHOLD;

        let os: Arc<dyn OsAccess> = Arc::new(RealOs);
        let wg = Arc::new(WorkerGroup::new("scanner-test", 2));
        let progress = Arc::new(Progress::default());
        let mut scanner =
            FileScanner::new(wg, os, Arc::clone(&progress), HashAlgorithm::Blake3);

        let file = ScanFile::new(path, stat);
        scanner.scan(&file);
        let result = scanner.finalize();

        assert!(file.is_invalid());
        assert_eq!(result.inodes.len(), 1);
        assert_eq!(progress.errors.load(Ordering::Relaxed), 1);
    }
}
