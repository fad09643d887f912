//! End-to-end scenarios: build → open → read, plus rewrite flows.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use dwarfs::metadata::{
    Chunk, DirEntry, Directory, InodeData, Metadata, MetadataBuilderOptions, StringTable,
};
use dwarfs::os::OsAccess;
use dwarfs::section::{SectionType, SectionWriter};
use dwarfs::{
    rewrite_filesystem, CompressionType, Filesystem, FilesystemOptions, FilesystemWriter,
    ImageData, RealOs, Registry, RewriteOptions, VerifyLevel, WriterOptions,
};

/// Deterministic byte stream (xorshift64), so image content never depends
/// on any external randomness source.
struct SeedStream(u64);

impl SeedStream {
    fn new(seed: u64) -> Self {
        SeedStream(if seed == 0 { 1 } else { seed })
    }

    fn fill(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            out.extend_from_slice(&self.0.to_le_bytes());
        }
        out.truncate(len);
        out
    }
}

fn write_file(dir: &Path, rel: &str, data: &[u8]) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::File::create(path).unwrap().write_all(data).unwrap();
}

fn build_image(root: &Path, options: WriterOptions) -> Vec<u8> {
    let os: Arc<dyn OsAccess> = Arc::new(RealOs);
    let writer = FilesystemWriter::new(options).unwrap();
    let mut out = Vec::new();
    writer.write_image(&os, root, &mut out).unwrap();
    out
}

fn open_image(image: Vec<u8>) -> Filesystem {
    Filesystem::from_image(ImageData::from_vec(image), FilesystemOptions::default()).unwrap()
}

fn writer_options(block_size: u32) -> WriterOptions {
    WriterOptions {
        block_size,
        metadata: MetadataBuilderOptions {
            no_create_timestamp: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

// ── S1: single file, random read ─────────────────────────────────────────────

#[test]
fn single_file_random_read() {
    let content = SeedStream::new(0xC0FFEE).fill(10 << 20);
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "data.bin", &content);

    let fs = open_image(build_image(dir.path(), writer_options(1 << 20)));

    let iv = fs.find("data.bin").expect("file is present");
    let inode = fs.open_file(iv).unwrap();
    let mut buf = [0u8; 64];
    let n = fs.read_into(inode, &mut buf, 5_242_881).unwrap();
    assert_eq!(n, 64);
    assert_eq!(&buf[..], &content[5_242_881..5_242_881 + 64]);

    assert_eq!(fs.check(VerifyLevel::Integrity, 4), 0);
}

// ── S2: duplicate files and hardlink ─────────────────────────────────────────

#[cfg(unix)]
#[test]
fn duplicates_and_hardlink_share_one_inode() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![0xAAu8; 1 << 20];
    write_file(dir.path(), "a/file", &payload);
    write_file(dir.path(), "b/file", &payload);
    std::fs::create_dir_all(dir.path().join("c")).unwrap();
    std::fs::hard_link(dir.path().join("a/file"), dir.path().join("c/link")).unwrap();

    let fs = open_image(build_image(dir.path(), writer_options(1 << 20)));

    assert_eq!(fs.statvfs().total_fs_size, 1_048_576);

    let a = fs.find("a/file").unwrap().num();
    let b = fs.find("b/file").unwrap().num();
    let l = fs.find("c/link").unwrap().num();
    assert_eq!(a, b);
    assert_eq!(a, l);

    let got = fs.read(a, 1 << 20, 0).unwrap();
    assert_eq!(got, payload);
}

// ── S4: partial decompression amortisation ───────────────────────────────────

#[test]
fn partial_decompression_amortisation() {
    let content = SeedStream::new(42).fill(16 << 20);
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "big", &content);

    let fs = open_image(build_image(dir.path(), writer_options(16 << 20)));
    assert_eq!(fs.num_blocks(), 1);

    let inode = fs.find("big").unwrap().num();

    let wait_for = |pred: &dyn Fn(&dwarfs::BlockCacheStats) -> bool| {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let stats = fs.cache_stats();
            if pred(&stats) {
                return stats;
            }
            assert!(std::time::Instant::now() < deadline, "gauge never settled: {stats:?}");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    };

    let got = fs.read(inode, 4, 0).unwrap();
    assert_eq!(got, &content[..4]);
    // the worker parks the block in the LRU right after fulfilling
    let stats = wait_for(&|s| s.partial_blocks_in_cache == 1);
    assert_eq!(stats.decompress_calls, 1);

    // 15 MiB / 16 MiB > decompress_ratio (0.8): one more decompress_until
    // brings the block to full size
    let off = 15_728_640;
    let got = fs.read(inode, 4, off).unwrap();
    assert_eq!(got, &content[off as usize..off as usize + 4]);
    let stats = wait_for(&|s| s.partial_blocks_in_cache == 0);
    assert_eq!(stats.decompress_calls, 2);
    assert_eq!(stats.total_decompressed_bytes, 16 << 20);
}

// ── S5: sequential prefetch ──────────────────────────────────────────────────

#[test]
fn sequential_prefetch_schedules_next_block() {
    let content = SeedStream::new(7).fill(20 << 20);
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "seq", &content);

    let mut options = FilesystemOptions::default();
    options.block_cache.sequential_access_detector_threshold = 3;
    let image = build_image(dir.path(), writer_options(1 << 20));
    let fs = Filesystem::from_image(ImageData::from_vec(image), options).unwrap();
    assert_eq!(fs.num_blocks(), 20);

    let inode = fs.find("seq").unwrap().num();
    for block in [7u64, 8, 9] {
        let off = (block << 20) as i64;
        let got = fs.read(inode, 16, off).unwrap();
        assert_eq!(got, &content[off as usize..off as usize + 16]);
    }

    // the prefetch of block 10 is fire-and-forget; wait for its effects
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let stats = fs.cache_stats();
        if stats.sequential_prefetches >= 1 && stats.blocks_created >= 4 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "prefetch never scheduled: {stats:?}"
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

// ── S6: legacy upgrade ───────────────────────────────────────────────────────

#[test]
fn legacy_shared_inodes_are_split_on_open() {
    // Craft a pre-2.2 image by hand: one 42-byte block, one legacy regular
    // inode referenced by two entries.
    let registry = Registry::with_builtin();
    let block_data: Vec<u8> = (0u8..42).collect();
    let payload = registry
        .compress_payload(CompressionType::Zstd, &block_data, 3, None)
        .unwrap();

    let legacy = Metadata {
        inodes: vec![
            InodeData { mode_index: 0, ..Default::default() },
            InodeData { mode_index: 1, ..Default::default() },
        ],
        modes: vec![0o040755, 0o100644],
        directories: vec![
            Directory { parent_entry: 0, first_entry: 1, self_entry: 0 },
            Directory { parent_entry: 0, first_entry: 3, self_entry: 0 },
        ],
        entry_table_v2_2: Some(vec![
            DirEntry { name_index: 0, inode_num: 0 },
            DirEntry { name_index: 1, inode_num: 1 },
            DirEntry { name_index: 2, inode_num: 1 },
        ]),
        chunk_table: vec![0, 1],
        chunks: vec![Chunk { block: 0, offset: 0, size: 42 }],
        names: StringTable {
            buffer: b"firstsecond".to_vec(),
            index: vec![0, 0, 5, 11],
            packed_index: false,
        },
        block_size: 4096,
        total_fs_size: 42,
        ..Metadata::default()
    };
    let (schema, tables) = legacy.to_sections().unwrap();

    let mut sw = SectionWriter::new(Vec::new());
    sw.write_section(SectionType::Block, CompressionType::Zstd, &payload)
        .unwrap();
    sw.write_section(SectionType::MetadataV2Schema, CompressionType::None, &schema)
        .unwrap();
    sw.write_section(SectionType::MetadataV2, CompressionType::None, &tables)
        .unwrap();
    let image = sw.finalize().unwrap();

    let fs = open_image(image);
    let first = fs.find("first").unwrap();
    let second = fs.find("second").unwrap();
    assert_ne!(first.num(), second.num());

    let sa = fs.getattr(first).unwrap();
    let sb = fs.getattr(second).unwrap();
    assert_eq!(sa.nlink, 1);
    assert_eq!(sb.nlink, 1);
    assert_eq!(sa.size, 42);

    // both point into the same chunk range
    assert_eq!(
        fs.read(first.num(), 42, 0).unwrap(),
        fs.read(second.num(), 42, 0).unwrap()
    );
    assert_eq!(fs.read(first.num(), 42, 0).unwrap(), block_data);
}

#[test]
fn rewrite_of_upgraded_legacy_image_reopens() {
    // A legacy tree with both a shared regular inode (two entries) and an
    // ordinary non-shared one.  After the upgrade every file goes through
    // the shared-files table, so the rebuild packs a table mixing a
    // two-member group with a single-member group — which the reader must
    // round-trip.
    let registry = Registry::with_builtin();
    let block_data: Vec<u8> = (0u8..42).collect();
    let payload = registry
        .compress_payload(CompressionType::Zstd, &block_data, 3, None)
        .unwrap();

    let legacy = Metadata {
        inodes: vec![
            InodeData { mode_index: 0, ..Default::default() },
            InodeData { mode_index: 1, ..Default::default() },
            InodeData { mode_index: 1, ..Default::default() },
        ],
        modes: vec![0o040755, 0o100644],
        directories: vec![
            Directory { parent_entry: 0, first_entry: 1, self_entry: 0 },
            Directory { parent_entry: 0, first_entry: 4, self_entry: 0 },
        ],
        entry_table_v2_2: Some(vec![
            DirEntry { name_index: 0, inode_num: 0 }, // root self
            DirEntry { name_index: 1, inode_num: 1 }, // a → shared
            DirEntry { name_index: 2, inode_num: 1 }, // b → shared
            DirEntry { name_index: 3, inode_num: 2 }, // c → its own
        ]),
        chunk_table: vec![0, 1, 2],
        chunks: vec![
            Chunk { block: 0, offset: 0, size: 30 },
            Chunk { block: 0, offset: 30, size: 12 },
        ],
        names: StringTable {
            buffer: b"abc".to_vec(),
            index: vec![0, 0, 1, 2, 3],
            packed_index: false,
        },
        block_size: 4096,
        total_fs_size: 42,
        ..Metadata::default()
    };
    let (schema, tables) = legacy.to_sections().unwrap();

    let mut sw = SectionWriter::new(Vec::new());
    sw.write_section(SectionType::Block, CompressionType::Zstd, &payload)
        .unwrap();
    sw.write_section(SectionType::MetadataV2Schema, CompressionType::None, &schema)
        .unwrap();
    sw.write_section(SectionType::MetadataV2, CompressionType::None, &tables)
        .unwrap();
    let fs = open_image(sw.finalize().unwrap());

    let mut out = Vec::new();
    rewrite_filesystem(
        &fs,
        &RewriteOptions {
            rebuild_metadata: Some(MetadataBuilderOptions {
                no_create_timestamp: true,
                ..Default::default()
            }),
            ..Default::default()
        },
        &mut out,
    )
    .unwrap();

    let fs2 = open_image(out);
    assert_eq!(fs2.check(VerifyLevel::Integrity, 2), 0);

    let a = fs2.find("a").unwrap();
    let b = fs2.find("b").unwrap();
    let c = fs2.find("c").unwrap();
    assert_ne!(a.num(), b.num());
    assert_ne!(a.num(), c.num());

    assert_eq!(fs2.read(a.num(), 30, 0).unwrap(), &block_data[..30]);
    assert_eq!(fs2.read(b.num(), 30, 0).unwrap(), &block_data[..30]);
    assert_eq!(fs2.read(c.num(), 12, 0).unwrap(), &block_data[30..]);
    assert_eq!(fs2.getattr(c).unwrap().size, 12);
    assert_eq!(fs2.statvfs().total_fs_size, 42);
}

// ── Roundtrip: extract(build(T)) == T ────────────────────────────────────────

#[test]
fn roundtrip_preserves_tree_and_contents() {
    let dir = tempfile::tempdir().unwrap();
    let mut stream = SeedStream::new(0xDEAD);
    let files: Vec<(&str, Vec<u8>)> = vec![
        ("top.txt", b"top level".to_vec()),
        ("empty", Vec::new()),
        ("deep/nested/tree/file.bin", stream.fill(300_000)),
        ("deep/other.bin", stream.fill(70_000)),
        ("deep/nested/small", vec![1, 2, 3]),
    ];
    for (rel, data) in &files {
        write_file(dir.path(), rel, data);
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink("top.txt", dir.path().join("link")).unwrap();

    let fs = open_image(build_image(dir.path(), writer_options(1 << 16)));

    for (rel, data) in &files {
        let iv = fs
            .find(rel)
            .unwrap_or_else(|| panic!("missing path {rel}"));
        assert!(iv.is_regular());
        let stat = fs.getattr(iv).unwrap();
        assert_eq!(stat.size, data.len() as u64, "{rel}");
        let got = fs.read(iv.num(), data.len().max(1), 0).unwrap();
        assert_eq!(&got, data, "{rel}");
    }

    #[cfg(unix)]
    {
        let link = fs.find("link").unwrap();
        assert_eq!(fs.readlink(link).unwrap(), "top.txt");
    }

    // directory structure via walk
    let mut paths = Vec::new();
    fs.walk(|e| paths.push(e.path.clone()));
    for (rel, _) in &files {
        assert!(paths.iter().any(|p| p == rel), "walk missed {rel}");
    }

    // readdir roundtrip on the root: '.', '..', then sorted entries
    let root = fs.root();
    let (dot, name) = fs.readdir(root, 0).unwrap();
    assert_eq!(name, ".");
    assert_eq!(dot.num(), root.num());
    let (_, name) = fs.readdir(root, 1).unwrap();
    assert_eq!(name, "..");
}

// ── Boundary behavior on the public API ──────────────────────────────────────

#[test]
fn read_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f", b"0123456789");
    let fs = open_image(build_image(dir.path(), writer_options(1 << 16)));
    let inode = fs.find("f").unwrap().num();

    assert!(fs.read(inode, 4, -1).is_err());
    assert!(fs.read(inode, 4, 10).unwrap().is_empty());
    assert!(fs.read(inode, 4, 1000).unwrap().is_empty());
    assert_eq!(fs.read(inode, 1000, 8).unwrap(), b"89");

    // type errors
    let root = fs.root();
    assert!(fs.open_file(root).is_err());
    assert!(fs.readlink(root).is_err());
}

// ── check() counts corrupt sections, reads fail targeted ─────────────────────

#[test]
fn corruption_detected_by_check_and_read() {
    let content = SeedStream::new(3).fill(200_000);
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "x", &content);

    let mut image = build_image(dir.path(), writer_options(1 << 16));

    // flip one byte inside the first BLOCK payload
    let sections = dwarfs::section::load_sections(&image).unwrap();
    let victim = sections
        .iter()
        .find(|s| s.section_type() == Some(SectionType::Block))
        .unwrap();
    let at = victim.start() + 10;
    image[at] ^= 0x80;

    let fs = open_image(image);
    assert!(fs.check(VerifyLevel::Checksum, 2) >= 1);

    // the corrupt block fails on access
    let inode = fs.find("x").unwrap().num();
    assert!(fs.read(inode, 64, 0).is_err());
}

// ── Rewrite: recompress ──────────────────────────────────────────────────────

#[test]
fn rewrite_recompress_preserves_contents() {
    let content = SeedStream::new(11).fill(500_000);
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "payload", &content);

    let fs = open_image(build_image(dir.path(), writer_options(1 << 16)));

    let mut out = Vec::new();
    rewrite_filesystem(
        &fs,
        &RewriteOptions {
            recompress_block: Some((CompressionType::Lz4, 0)),
            recompress_metadata: Some((CompressionType::Zstd, 5)),
            enable_history: true,
            history_arguments: vec!["--recompress=lz4".into()],
            ..Default::default()
        },
        &mut out,
    )
    .unwrap();

    let fs2 = open_image(out);
    assert_eq!(fs2.check(VerifyLevel::Integrity, 2), 0);
    let inode = fs2.find("payload").unwrap().num();
    assert_eq!(fs2.read(inode, content.len(), 0).unwrap(), content);

    // blocks now carry lz4
    let block = fs2
        .sections()
        .iter()
        .find(|s| s.section_type() == Some(SectionType::Block))
        .unwrap();
    assert_eq!(block.compression(), Some(CompressionType::Lz4));

    // a history entry was appended
    assert_eq!(fs2.history().unwrap().entries.len(), 2);
}

// ── Rewrite: change block size ───────────────────────────────────────────────

#[test]
fn rewrite_change_block_size() {
    let content = SeedStream::new(23).fill(700_000);
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "a", &content);
    write_file(dir.path(), "b", &content[..100_000]);

    let fs = open_image(build_image(dir.path(), writer_options(1 << 18)));
    let old_blocks = fs.num_blocks();

    let mut out = Vec::new();
    rewrite_filesystem(
        &fs,
        &RewriteOptions {
            recompress_block: Some((CompressionType::Zstd, 3)),
            recompress_metadata: Some((CompressionType::Zstd, 3)),
            change_block_size: Some(1 << 16),
            rebuild_metadata: Some(MetadataBuilderOptions {
                no_create_timestamp: true,
                ..Default::default()
            }),
            ..Default::default()
        },
        &mut out,
    )
    .unwrap();

    let fs2 = open_image(out);
    assert_eq!(fs2.statvfs().block_size, 1 << 16);
    assert!(fs2.num_blocks() > old_blocks);
    assert_eq!(fs2.check(VerifyLevel::Integrity, 2), 0);

    let a = fs2.find("a").unwrap().num();
    assert_eq!(fs2.read(a, content.len(), 0).unwrap(), content);
    let b = fs2.find("b").unwrap().num();
    assert_eq!(fs2.read(b, 100_000, 0).unwrap(), &content[..100_000]);

    // random offsets through the remapped chunks
    for off in [0usize, 65_535, 65_536, 131_000, 699_000] {
        let want = &content[off..(off + 1000).min(content.len())];
        assert_eq!(fs2.read(a, want.len(), off as i64).unwrap(), want);
    }

    // the misconfiguration is rejected
    let err = rewrite_filesystem(
        &fs,
        &RewriteOptions {
            change_block_size: Some(1 << 16),
            ..Default::default()
        },
        &mut Vec::new(),
    );
    assert!(err.is_err());
}

// ── Opaque image header ──────────────────────────────────────────────────────

#[test]
fn opaque_header_is_skipped_and_preserved() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f", b"behind a header");
    let image = build_image(dir.path(), writer_options(1 << 16));

    let mut with_header = b"#!/bin/dwarfs-selfextract\n".to_vec();
    with_header.resize(128, 0);
    let header_len = with_header.len();
    with_header.extend_from_slice(&image);

    let mut options = FilesystemOptions::default();
    options.image_offset = header_len;
    let fs = Filesystem::from_image(ImageData::from_vec(with_header), options).unwrap();
    let inode = fs.find("f").unwrap().num();
    assert_eq!(fs.read(inode, 100, 0).unwrap(), b"behind a header");

    // a rewrite keeps the header bytes in place
    let mut out = Vec::new();
    rewrite_filesystem(&fs, &RewriteOptions::default(), &mut out).unwrap();
    assert_eq!(&out[..header_len], &fs.image().as_slice()[..header_len]);

    let mut options = FilesystemOptions::default();
    options.image_offset = header_len;
    let fs2 = Filesystem::from_image(ImageData::from_vec(out), options).unwrap();
    assert_eq!(fs2.read(fs2.find("f").unwrap().num(), 100, 0).unwrap(), b"behind a header");
}

// ── Determinism across worker counts (P2) ────────────────────────────────────

#[test]
fn image_bytes_identical_across_worker_counts() {
    let dir = tempfile::tempdir().unwrap();
    let mut stream = SeedStream::new(99);
    for i in 0..12 {
        write_file(dir.path(), &format!("f{i:02}"), &stream.fill(40_000 + i * 1000));
    }

    // the history entry carries a wall-clock timestamp; disable it so the
    // two builds are comparable byte for byte
    let mut opts_a = writer_options(1 << 16);
    opts_a.num_workers = 1;
    opts_a.enable_history = false;
    let mut opts_b = writer_options(1 << 16);
    opts_b.num_workers = 8;
    opts_b.enable_history = false;

    let a = build_image(dir.path(), opts_a);
    let b = build_image(dir.path(), opts_b);
    assert_eq!(a, b);
}
