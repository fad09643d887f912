//! Rewriter — re-pack an existing image.
//!
//! Three progressively deeper modes, freely combined through
//! [`RewriteOptions`]:
//!
//! 1. **Recompress**: selected sections (blocks, optionally filtered by
//!    category, and/or the metadata pair) are decompressed and re-encoded;
//!    everything else is copied bit-for-bit (headers re-emitted with fresh
//!    numbers and checksums).
//! 2. **Rebuild metadata**: the frozen metadata is decoded into the
//!    builder and re-packed with new options; chunk lists are carried over
//!    unchanged.
//! 3. **Change block size**: block data is re-streamed per category
//!    (respecting granularity; blocks are only merged when category *and*
//!    category metadata agree), chunks are remapped through the old→new
//!    block layout, and the metadata is rebuilt.  This requires block and
//!    metadata recompression plus the metadata rebuild, and is checked.
//!
//! Any opaque image header is preserved; history entries are carried
//! forward and a new entry is appended when history is enabled.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::codec::PayloadRef;
use crate::error::{DwarfsError, Result};
use crate::metadata::{
    BuilderEntry, BuilderEntryKind, Chunk, InodeRank, MetadataBuilder, MetadataBuilderOptions,
};
use crate::reader::Filesystem;
use crate::section::{CompressionType, SectionType, SectionWriter};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct RewriteOptions {
    /// Re-encode BLOCK sections with this compression.
    pub recompress_block: Option<(CompressionType, i32)>,
    /// Re-encode the metadata pair with this compression.
    pub recompress_metadata: Option<(CompressionType, i32)>,
    /// Category filter for block recompression; empty = all categories.
    pub recompress_categories: Vec<String>,
    /// Invert the category filter.
    pub recompress_categories_exclude: bool,
    /// Re-stream blocks into a new (power of two) block size.
    pub change_block_size: Option<u32>,
    /// Decode and re-pack the metadata with these builder options.
    pub rebuild_metadata: Option<MetadataBuilderOptions>,
    pub enable_history: bool,
    pub history_arguments: Vec<String>,
}

// ── Entry point ──────────────────────────────────────────────────────────────

pub fn rewrite_filesystem<W: Write>(
    fs: &Filesystem,
    options: &RewriteOptions,
    mut out: W,
) -> Result<()> {
    if let Some(bs) = options.change_block_size {
        if !bs.is_power_of_two() {
            return Err(DwarfsError::InvalidArgument(format!(
                "new block size {bs} is not a power of two"
            )));
        }
        if options.recompress_block.is_none() {
            return Err(DwarfsError::InvalidArgument(
                "change_block_size requires recompress_block".into(),
            ));
        }
        if options.recompress_metadata.is_none() {
            return Err(DwarfsError::InvalidArgument(
                "change_block_size requires recompress_metadata".into(),
            ));
        }
        if options.rebuild_metadata.is_none() {
            return Err(DwarfsError::InvalidArgument(
                "change_block_size requires rebuild_metadata".into(),
            ));
        }
    }

    // keep the original opaque header, if any
    let image = fs.image().as_slice();
    out.write_all(&image[..fs.image_offset()])?;
    let mut sw = SectionWriter::new(out);

    // ── blocks ───────────────────────────────────────────────────────────────
    let mapping = if options.change_block_size.is_some() {
        restream_blocks(fs, options, &mut sw)?
    } else {
        copy_or_recompress_blocks(fs, options, &mut sw)?
    };

    // ── metadata ─────────────────────────────────────────────────────────────
    if options.rebuild_metadata.is_some() || options.change_block_size.is_some() {
        rebuild_metadata(fs, options, &mapping, &mut sw)?;
    } else {
        for ty in [SectionType::MetadataV2Schema, SectionType::MetadataV2] {
            let sec = fs
                .sections()
                .iter()
                .find(|s| s.section_type() == Some(ty))
                .ok_or_else(|| {
                    DwarfsError::InvalidArgument(format!("image has no {} section", ty.name()))
                })?;
            match options.recompress_metadata {
                Some((ct, level)) => {
                    let payload =
                        PayloadRef::new(Arc::clone(fs.image()), sec.start(), sec.length() as usize);
                    let raw = fs
                        .registry()
                        .decompress_payload(sec.checked_compression()?, payload)?;
                    let recompressed = fs.registry().compress_payload(ct, &raw, level, None)?;
                    sw.write_section(ty, ct, &recompressed)?;
                }
                None => {
                    sw.write_raw(sec.raw_type(), sec.raw_compression(), sec.data(image))?;
                }
            }
        }
    }

    // ── remaining sections (history, unknown) ────────────────────────────────
    let mut wrote_history = false;
    for sec in fs.sections() {
        match sec.section_type() {
            Some(SectionType::Block)
            | Some(SectionType::MetadataV2Schema)
            | Some(SectionType::MetadataV2)
            | Some(SectionType::SectionIndex) => {}
            Some(SectionType::History) => {
                write_history(fs, options, &mut sw)?;
                wrote_history = true;
            }
            None => {
                // forward-compatibility: carry unknown sections verbatim
                sw.write_raw(sec.raw_type(), sec.raw_compression(), sec.data(image))?;
            }
        }
    }
    if !wrote_history && options.enable_history {
        write_history(fs, options, &mut sw)?;
    }

    let mut out = sw.finalize()?;
    out.flush()?;
    Ok(())
}

fn write_history<W: Write>(
    fs: &Filesystem,
    options: &RewriteOptions,
    sw: &mut SectionWriter<W>,
) -> Result<()> {
    let mut history = fs.history().cloned().unwrap_or_default();
    if options.enable_history {
        history.append_now(options.history_arguments.clone());
    }
    sw.write_section(SectionType::History, CompressionType::None, &history.to_bytes())?;
    Ok(())
}

// ── Block handling ───────────────────────────────────────────────────────────

/// Where each byte of an old block landed.
struct MappedSegment {
    old_offset: u64,
    len: u64,
    new_block: u32,
    new_offset: u64,
}

/// old block number → ordered segments (identity when blocks are kept).
type BlockMapping = HashMap<u32, Vec<MappedSegment>>;

fn category_matches(options: &RewriteOptions, category: Option<&str>) -> bool {
    if options.recompress_categories.is_empty() {
        return true;
    }
    let listed = category
        .map(|c| options.recompress_categories.iter().any(|f| f == c))
        .unwrap_or(false);
    listed != options.recompress_categories_exclude
}

/// Section-by-section path: copy or recompress, block numbers unchanged.
fn copy_or_recompress_blocks<W: Write>(
    fs: &Filesystem,
    options: &RewriteOptions,
    sw: &mut SectionWriter<W>,
) -> Result<BlockMapping> {
    let image = fs.image().as_slice();
    let mut mapping = BlockMapping::new();
    let mut block_no = 0u32;

    for sec in fs.sections() {
        if sec.section_type() != Some(SectionType::Block) {
            continue;
        }
        let category = fs.block_category(block_no as usize);
        let recompress = options
            .recompress_block
            .filter(|_| category_matches(options, category));

        let uncompressed_len;
        match recompress {
            Some((ct, level)) => {
                let payload =
                    PayloadRef::new(Arc::clone(fs.image()), sec.start(), sec.length() as usize);
                let raw = fs
                    .registry()
                    .decompress_payload(sec.checked_compression()?, payload)?;
                uncompressed_len = raw.len() as u64;
                let metadata = block_metadata_value(fs, block_no);
                let recompressed =
                    fs.registry()
                        .compress_payload(ct, &raw, level, metadata.as_ref())?;
                sw.write_section(SectionType::Block, ct, &recompressed)?;
            }
            None => {
                let payload = sec.data(image);
                uncompressed_len = fs
                    .registry()
                    .uncompressed_size(sec.checked_compression()?, payload)?
                    as u64;
                sw.write_raw(sec.raw_type(), sec.raw_compression(), payload)?;
            }
        }

        mapping.insert(
            block_no,
            vec![MappedSegment {
                old_offset: 0,
                len: uncompressed_len,
                new_block: block_no,
                new_offset: 0,
            }],
        );
        block_no += 1;
    }

    Ok(mapping)
}

/// Re-stream path: group old blocks into per-(category, metadata) streams
/// and refill them at the new block size, respecting granularity.
fn restream_blocks<W: Write>(
    fs: &Filesystem,
    options: &RewriteOptions,
    sw: &mut SectionWriter<W>,
) -> Result<BlockMapping> {
    let (ct, level) = options.recompress_block.expect("validated by caller");
    let new_block_size = options.change_block_size.expect("validated by caller") as usize;

    // Streams keyed by (category, metadata); block order within a stream
    // follows old block numbers, and streams are processed in order of
    // first appearance — all deterministic.
    type StreamKey = (Option<String>, Option<String>);
    let mut stream_order: Vec<StreamKey> = Vec::new();
    let mut streams: HashMap<StreamKey, Vec<u32>> = HashMap::new();

    let num_blocks = fs.num_blocks() as u32;
    for block_no in 0..num_blocks {
        let key: StreamKey = (
            fs.block_category(block_no as usize).map(str::to_owned),
            fs.block_category_metadata(block_no as usize).map(str::to_owned),
        );
        if !streams.contains_key(&key) {
            stream_order.push(key.clone());
        }
        streams.entry(key).or_default().push(block_no);
    }

    let mut mapping = BlockMapping::new();
    let mut new_block_no = 0u32;

    for key in &stream_order {
        let (_category, metadata_str) = key;
        let metadata: Option<Value> = metadata_str
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok());

        let constraints = fs
            .registry()
            .compression_constraints(ct, metadata.as_ref())?;
        let usable = constraints.clamp_block_size(new_block_size);

        let mut open: Vec<u8> = Vec::with_capacity(usable);
        let old_blocks = &streams[key];

        let flush =
            |open: &mut Vec<u8>, new_block_no: &mut u32, sw: &mut SectionWriter<W>| -> Result<()> {
                if open.is_empty() {
                    return Ok(());
                }
                let payload = fs
                    .registry()
                    .compress_payload(ct, open, level, metadata.as_ref())?;
                sw.write_section(SectionType::Block, ct, &payload)?;
                *new_block_no += 1;
                open.clear();
                Ok(())
            };

        for &old in old_blocks {
            let sec = fs
                .sections()
                .iter()
                .filter(|s| s.section_type() == Some(SectionType::Block))
                .nth(old as usize)
                .expect("block section exists");
            let payload =
                PayloadRef::new(Arc::clone(fs.image()), sec.start(), sec.length() as usize);
            let data = fs
                .registry()
                .decompress_payload(sec.checked_compression()?, payload)?;

            let mut segments = Vec::new();
            let mut pos = 0usize;
            while pos < data.len() {
                let space = usable - open.len();
                let take = space.min(data.len() - pos);
                segments.push(MappedSegment {
                    old_offset: pos as u64,
                    len: take as u64,
                    new_block: new_block_no,
                    new_offset: open.len() as u64,
                });
                open.extend_from_slice(&data[pos..pos + take]);
                pos += take;
                if open.len() == usable {
                    flush(&mut open, &mut new_block_no, sw)?;
                }
            }
            if segments.is_empty() {
                // zero-length old block still needs a mapping entry
                segments.push(MappedSegment {
                    old_offset: 0,
                    len: 0,
                    new_block: new_block_no,
                    new_offset: 0,
                });
            }
            mapping.insert(old, segments);
        }

        // stream boundary: categories never share a block
        flush(&mut open, &mut new_block_no, sw)?;
    }

    debug!(
        "restreamed {} old blocks into {} new blocks",
        num_blocks, new_block_no
    );

    Ok(mapping)
}

fn block_metadata_value(fs: &Filesystem, block_no: u32) -> Option<Value> {
    fs.block_category_metadata(block_no as usize)
        .and_then(|s| serde_json::from_str(s).ok())
}

/// Remap one chunk through the block mapping, splitting where the chunk
/// now straddles new-block boundaries.
fn remap_chunk(mapping: &BlockMapping, chunk: &Chunk) -> Result<Vec<Chunk>> {
    let segments = mapping.get(&chunk.block).ok_or_else(|| {
        DwarfsError::InvalidArgument(format!("chunk references unmapped block {}", chunk.block))
    })?;

    let mut out = Vec::new();
    let mut begin = u64::from(chunk.offset);
    let mut remaining = u64::from(chunk.size);

    for seg in segments {
        if remaining == 0 {
            break;
        }
        let seg_end = seg.old_offset + seg.len;
        if begin >= seg_end {
            continue;
        }
        let within = begin - seg.old_offset;
        let take = (seg.len - within).min(remaining);
        out.push(Chunk {
            block: seg.new_block,
            offset: (seg.new_offset + within) as u32,
            size: take as u32,
        });
        begin += take;
        remaining -= take;
    }

    if remaining > 0 {
        return Err(DwarfsError::InvalidArgument(format!(
            "chunk {:?} not fully covered by block mapping",
            chunk
        )));
    }
    Ok(out)
}

// ── Metadata rebuild ─────────────────────────────────────────────────────────

fn rebuild_metadata<W: Write>(
    fs: &Filesystem,
    options: &RewriteOptions,
    mapping: &BlockMapping,
    sw: &mut SectionWriter<W>,
) -> Result<()> {
    let builder_options = options.rebuild_metadata.clone().unwrap_or_default();
    let view = fs.metadata();
    let new_block_size = options
        .change_block_size
        .unwrap_or(view.block_size());

    let mut builder = MetadataBuilder::new(builder_options);
    builder.set_block_size(new_block_size);
    builder.set_root(rebuild_entry(fs, view.root())?);

    for object in 0..view.num_objects() {
        let mut chunks = Vec::new();
        for chunk in view.object_chunks(object)? {
            chunks.extend(remap_chunk(mapping, chunk)?);
        }
        builder.set_chunk_list(object, chunks);
    }

    // carry the category tables through the (possibly changed) block layout
    let md = view.metadata();
    if !md.category_names.is_empty() {
        let mut name_ids: HashMap<&str, u32> = HashMap::new();
        let mut names = Vec::new();
        let mut block_categories = Vec::new();
        let mut metadata_ids: HashMap<&str, u32> = HashMap::new();
        let mut metadata_json = Vec::new();
        let mut block_md = std::collections::BTreeMap::new();

        // new physical block → (category, metadata) via the mapping
        let mut new_block_info: std::collections::BTreeMap<u32, (Option<&str>, Option<&str>)> =
            std::collections::BTreeMap::new();
        for (&old, segments) in mapping {
            let cat = fs.block_category(old as usize);
            let cmd = fs.block_category_metadata(old as usize);
            for seg in segments {
                new_block_info.entry(seg.new_block).or_insert((cat, cmd));
            }
        }

        for (&new_block, &(cat, cmd)) in &new_block_info {
            debug_assert_eq!(new_block as usize, block_categories.len());
            let cat_id = match cat {
                Some(name) => *name_ids.entry(name).or_insert_with(|| {
                    names.push(name.to_string());
                    (names.len() - 1) as u32
                }),
                None => *name_ids.entry("<default>").or_insert_with(|| {
                    names.push("<default>".to_string());
                    (names.len() - 1) as u32
                }),
            };
            block_categories.push(cat_id);
            if let Some(cmd) = cmd {
                let md_id = *metadata_ids.entry(cmd).or_insert_with(|| {
                    metadata_json.push(cmd.to_string());
                    (metadata_json.len() - 1) as u32
                });
                block_md.insert(new_block, md_id);
            }
        }

        builder.set_categories(names, block_categories, metadata_json, block_md);
    }

    let metadata = builder.build()?;
    let (schema_bytes, table_bytes) = metadata.to_sections()?;

    let (ct, level) = options
        .recompress_metadata
        .unwrap_or((CompressionType::Zstd, 3));
    let schema_payload = fs.registry().compress_payload(ct, &schema_bytes, level, None)?;
    sw.write_section(SectionType::MetadataV2Schema, ct, &schema_payload)?;
    let table_payload = fs.registry().compress_payload(ct, &table_bytes, level, None)?;
    sw.write_section(SectionType::MetadataV2, ct, &table_payload)?;
    Ok(())
}

/// Reconstruct the builder tree from a mounted view.
fn rebuild_entry(fs: &Filesystem, iv: crate::metadata::InodeView<'_>) -> Result<BuilderEntry> {
    let view = fs.metadata();
    let stat = view.getattr(iv)?;

    let kind = match iv.rank() {
        InodeRank::Directory => {
            let mut children = Vec::new();
            let mut offset = 2; // skip . and ..
            while let Some((child, name)) = view.readdir(iv, offset) {
                let mut entry = rebuild_entry(fs, child)?;
                entry.name = name;
                children.push(entry);
                offset += 1;
            }
            BuilderEntryKind::Directory { children }
        }
        InodeRank::Regular => BuilderEntryKind::File {
            regular_index: view.regular_index(iv.num()).expect("regular inode"),
            object: view.object_index(iv.num())?,
        },
        InodeRank::Symlink => BuilderEntryKind::Symlink {
            target: view.symlink_target(iv.num())?.to_vec(),
        },
        InodeRank::Device => BuilderEntryKind::Device { rdev: stat.rdev },
        InodeRank::Other => BuilderEntryKind::Other,
    };

    Ok(BuilderEntry {
        name: Vec::new(), // filled by the parent
        kind,
        mode: stat.mode,
        uid: stat.uid,
        gid: stat.gid,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
    })
}
