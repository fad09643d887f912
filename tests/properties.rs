//! Property tests: cache idempotence, merger determinism, packing
//! roundtrips.

use std::io::Write as _;
use std::sync::Arc;

use proptest::prelude::*;

use dwarfs::metadata::MetadataBuilderOptions;
use dwarfs::os::OsAccess;
use dwarfs::{
    Filesystem, FilesystemOptions, FilesystemWriter, ImageData, MultiQueueBlockMerger, RealOs,
    WriterOptions,
};

fn build_fixture_image(seed: u64) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    for i in 0..4 {
        let len = 30_000 + (next() % 50_000) as usize;
        let data: Vec<u8> = (0..len).map(|_| (next() & 0xff) as u8).collect();
        let path = dir.path().join(format!("file{i}"));
        std::fs::File::create(path).unwrap().write_all(&data).unwrap();
    }

    let os: Arc<dyn OsAccess> = Arc::new(RealOs);
    let writer = FilesystemWriter::new(WriterOptions {
        block_size: 1 << 15,
        metadata: MetadataBuilderOptions {
            no_create_timestamp: true,
            ..Default::default()
        },
        enable_history: false,
        ..Default::default()
    })
    .unwrap();
    let mut out = Vec::new();
    writer.write_image(&os, dir.path(), &mut out).unwrap();
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Cache idempotence: for any interleaving of readers, any cache
    /// budget and any decompress ratio, every (offset, size) request
    /// returns the same bytes.
    #[test]
    fn cache_reads_are_idempotent(
        max_bytes_blocks in 1usize..6,
        decompress_ratio in 0.1f64..1.0,
        reads in prop::collection::vec((0usize..160_000, 1usize..5_000), 1..24),
    ) {
        let image = build_fixture_image(0xFEED);

        // reference contents from a plain open
        let reference = Filesystem::from_image(
            ImageData::from_vec(image.clone()),
            FilesystemOptions::default(),
        ).unwrap();
        let inode = reference.find("file0").unwrap().num();
        let size = reference.getattr(reference.find("file0").unwrap()).unwrap().size as usize;
        let full = reference.read(inode, size, 0).unwrap();

        let mut options = FilesystemOptions::default();
        options.block_cache.max_bytes = max_bytes_blocks * (1 << 15);
        options.block_cache.decompress_ratio = decompress_ratio;
        let fs = Filesystem::from_image(ImageData::from_vec(image), options).unwrap();
        let inode = fs.find("file0").unwrap().num();

        for &(off, len) in &reads {
            let got = fs.read(inode, len, (off % size) as i64).unwrap();
            let start = off % size;
            let want = &full[start..(start + len).min(size)];
            prop_assert_eq!(&got[..], want);
        }
    }

    /// Merger determinism: the emitted sequence depends only on the source
    /// order and per-source block counts, never on producer delays.
    #[test]
    fn merger_output_independent_of_delays(
        block_counts in prop::collection::vec(1usize..6, 1..5),
        num_active_slots in 1usize..4,
        delays in prop::collection::vec(0u64..200, 1..5),
    ) {
        let sources: Vec<usize> = (0..block_counts.len()).collect();

        let run = |delay_seed: &[u64]| -> Vec<(usize, usize)> {
            let (tx, rx) = std::sync::mpsc::channel();
            let merger = Arc::new(MultiQueueBlockMerger::new(
                num_active_slots,
                3,
                &sources,
                Box::new(move |holder| {
                    let _ = tx.send(*holder.value());
                }),
            ));
            std::thread::scope(|scope| {
                for (src, &count) in block_counts.iter().enumerate() {
                    let merger = Arc::clone(&merger);
                    let delay = delay_seed[src % delay_seed.len()];
                    scope.spawn(move || {
                        for i in 0..count {
                            if delay > 0 {
                                std::thread::sleep(std::time::Duration::from_micros(
                                    delay * ((i + src) as u64 % 3),
                                ));
                            }
                            merger.add(src, (src, i), 1, i + 1 == count);
                        }
                    });
                }
            });
            rx.try_iter().collect()
        };

        let baseline = run(&[0]);
        let delayed = run(&delays);
        prop_assert_eq!(baseline, delayed);
    }

    /// uleb128 survives arbitrary values.
    #[test]
    fn uleb128_roundtrip(v in any::<u64>()) {
        let mut buf = Vec::new();
        dwarfs::codec::write_uleb128(&mut buf, v);
        let (decoded, used) = dwarfs::codec::read_uleb128(&buf).unwrap();
        prop_assert_eq!(decoded, v);
        prop_assert_eq!(used, buf.len());
    }

    /// String table index packing is lossless.
    #[test]
    fn string_table_pack_roundtrip(strings in prop::collection::vec(".{0,40}", 0..20)) {
        let mut buffer = Vec::new();
        let mut index = vec![0u32];
        for s in &strings {
            buffer.extend_from_slice(s.as_bytes());
            index.push(buffer.len() as u32);
        }
        let mut table = dwarfs::metadata::StringTable {
            buffer,
            index,
            packed_index: false,
        };
        let plain = table.clone();
        table.pack_index();
        prop_assert!(table.packed_index);
        for (i, s) in strings.iter().enumerate() {
            prop_assert_eq!(table.get(i as u32).unwrap(), s.as_bytes());
        }
        table.unpack_index();
        prop_assert_eq!(table, plain);
    }
}
