//! Host filesystem access, as consumed by the writer side.
//!
//! The core never touches the OS directly; everything goes through
//! [`OsAccess`] so tests can substitute fakes and platforms can supply
//! their own mapping backends.  [`RealOs`] is the std/memmap2-backed
//! default.  `stat` has `lstat` semantics (symlinks are not followed) and
//! `read_dir` returns names sorted bytewise, which is what makes tree
//! scans reproducible.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use crate::image::{FileView, ImageData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFileType {
    Directory,
    Regular,
    Symlink,
    Device,
    Other,
}

/// Host attributes of one filesystem object.
#[derive(Debug, Clone, Copy)]
pub struct HostStat {
    pub file_type: HostFileType,
    pub size: u64,
    /// Full mode bits including the file type (S_IFMT).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub raw_inode: u64,
    pub nlink: u64,
    pub rdev: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

pub trait OsAccess: Send + Sync {
    /// `lstat`-style attributes.
    fn stat(&self, path: &Path) -> io::Result<HostStat>;

    /// Child names of a directory, sorted bytewise.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Map a whole file read-only.
    fn map_file(&self, path: &Path) -> io::Result<FileView>;
}

// ── RealOs ───────────────────────────────────────────────────────────────────

/// The std-backed implementation used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealOs;

impl OsAccess for RealOs {
    fn stat(&self, path: &Path) -> io::Result<HostStat> {
        let md = std::fs::symlink_metadata(path)?;
        let ft = md.file_type();

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            use std::os::unix::fs::MetadataExt;
            let file_type = if ft.is_dir() {
                HostFileType::Directory
            } else if ft.is_symlink() {
                HostFileType::Symlink
            } else if ft.is_file() {
                HostFileType::Regular
            } else if ft.is_block_device() || ft.is_char_device() {
                HostFileType::Device
            } else {
                HostFileType::Other
            };
            Ok(HostStat {
                file_type,
                size: md.size(),
                mode: md.mode(),
                uid: md.uid(),
                gid: md.gid(),
                raw_inode: md.ino(),
                nlink: md.nlink(),
                rdev: md.rdev(),
                atime: md.atime().max(0) as u64,
                mtime: md.mtime().max(0) as u64,
                ctime: md.ctime().max(0) as u64,
            })
        }

        #[cfg(not(unix))]
        {
            use crate::metadata::{S_IFDIR, S_IFLNK, S_IFREG};
            let (file_type, type_bits) = if ft.is_dir() {
                (HostFileType::Directory, S_IFDIR)
            } else if ft.is_symlink() {
                (HostFileType::Symlink, S_IFLNK)
            } else {
                (HostFileType::Regular, S_IFREG)
            };
            let perms = if md.permissions().readonly() { 0o555 } else { 0o755 };
            let mtime = md
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            Ok(HostStat {
                file_type,
                size: md.len(),
                mode: type_bits | perms,
                uid: 0,
                gid: 0,
                raw_inode: 0,
                nlink: 1,
                rdev: 0,
                atime: mtime,
                mtime,
                ctime: mtime,
            })
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut names: Vec<OsString> = std::fs::read_dir(path)?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<io::Result<_>>()?;
        names.sort_unstable_by(|a, b| a.as_encoded_bytes().cmp(b.as_encoded_bytes()));
        Ok(names)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn map_file(&self, path: &Path) -> io::Result<FileView> {
        ImageData::open(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stat_and_map_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(b"hello")
            .unwrap();

        let os = RealOs;
        let st = os.stat(&file).unwrap();
        assert_eq!(st.file_type, HostFileType::Regular);
        assert_eq!(st.size, 5);

        let view = os.map_file(&file).unwrap();
        assert_eq!(&view[..], b"hello");
    }

    #[test]
    fn read_dir_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zebra", "alpha", "mid"] {
            std::fs::File::create(dir.path().join(name)).unwrap();
        }
        let names = RealOs.read_dir(dir.path()).unwrap();
        assert_eq!(names, vec!["alpha", "mid", "zebra"]);
    }
}
