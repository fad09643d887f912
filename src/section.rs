//! Section container — bit-exact parsing and emission of image sections.
//!
//! # On-disk layout, v2 header (64 bytes, all numeric fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      6   magic         = "DWARFS"  (6 ASCII bytes)
//!    6      1   major         = 2
//!    7      1   minor         = 5
//!    8     32   sha2_512_256  over all bytes following this field
//!   40      8   xxh3_64       over all bytes following this field  (LE u64)
//!   48      4   number        monotonically increasing from 0      (LE u32)
//!   52      2   type          section_type                         (LE u16)
//!   54      2   compression   compression_type                     (LE u16)
//!   56      8   length        payload length in bytes              (LE u64)
//! ```
//! `payload` (`length` bytes) follows immediately.
//!
//! The legacy v1 header (20 bytes: magic, major=1, minor, type, compression,
//! length) has no integrity fields and is read-only compatible.
//!
//! # Section index
//!
//! The last section of every image is a `SECTION_INDEX` whose payload is an
//! array of LE u64 entries, each `(type << 48) | offset`.  Offsets are
//! relative to the start of the first section header (i.e. after any opaque
//! image header).  The index's own entry points to itself.  Readers locate
//! the index from the final 8 bytes of the image; a full forward scan is the
//! fallback for images without one.
//!
//! # Checksums
//!
//! `xxh3_64` covers header bytes 48..64 plus the payload; `sha2_512_256`
//! covers header bytes 40..64 plus the payload.  Verification results are
//! memoized per section, so repeated `check` calls are free.
//!
//! # Failure policy
//!
//! Structural errors (bad magic, bad version, truncation, overflow) abort
//! the containing operation.  Checksum mismatches are reported per section;
//! whether they are tolerated is the caller's decision (they are, for
//! non-essential sections such as `HISTORY`).  Unknown section/compression
//! types never abort parsing — they fail only when the section is accessed.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

use crate::checksum::{sha2_512_256_multi, xxh3_64_multi, SHA2_512_256_LEN};

// ── Constants ────────────────────────────────────────────────────────────────

pub const MAGIC: &[u8; 6] = b"DWARFS";
pub const MAJOR_VERSION: u8 = 2;
pub const MINOR_VERSION: u8 = 5;

/// Fixed byte size of the v2 section header.
pub const HEADER_V2_SIZE: usize = 64;
/// Fixed byte size of the legacy v1 section header.
pub const HEADER_V1_SIZE: usize = 20;

const XXH3_COVER_OFFSET: usize = 48; // number..payload end
const SHA2_COVER_OFFSET: usize = 40; // xxh3_64..payload end

// ── Section type ─────────────────────────────────────────────────────────────

/// Discriminates the role of a section within the image (closed set).
///
/// Values are frozen; unknown values are tolerated while reading for forward
/// compatibility and only rejected when the section is actually accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SectionType {
    /// One block of file data.
    Block = 0,
    /// Schema descriptor for the metadata section.
    MetadataV2Schema = 7,
    /// The packed metadata tables.
    MetadataV2 = 8,
    /// O(1) lookup table; always the final section.
    SectionIndex = 9,
    /// Build/rewrite history; non-essential.
    History = 10,
}

impl SectionType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(SectionType::Block),
            7 => Some(SectionType::MetadataV2Schema),
            8 => Some(SectionType::MetadataV2),
            9 => Some(SectionType::SectionIndex),
            10 => Some(SectionType::History),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SectionType::Block => "BLOCK",
            SectionType::MetadataV2Schema => "METADATA_V2_SCHEMA",
            SectionType::MetadataV2 => "METADATA_V2",
            SectionType::SectionIndex => "SECTION_INDEX",
            SectionType::History => "HISTORY",
        }
    }
}

// ── Compression type ─────────────────────────────────────────────────────────

/// On-disk compression discriminant (closed set).
///
/// Whether a type can actually be decoded depends on the codec registry;
/// `FLAC` and `RICEPP` are known types whose codecs are external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompressionType {
    None = 0,
    Lzma = 1,
    Zstd = 2,
    Lz4 = 3,
    Lz4hc = 4,
    Brotli = 5,
    Zlib = 6,
    Flac = 7,
    Ricepp = 8,
}

impl CompressionType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lzma),
            2 => Some(CompressionType::Zstd),
            3 => Some(CompressionType::Lz4),
            4 => Some(CompressionType::Lz4hc),
            5 => Some(CompressionType::Brotli),
            6 => Some(CompressionType::Zlib),
            7 => Some(CompressionType::Flac),
            8 => Some(CompressionType::Ricepp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Lzma => "lzma",
            CompressionType::Zstd => "zstd",
            CompressionType::Lz4 => "lz4",
            CompressionType::Lz4hc => "lz4hc",
            CompressionType::Brotli => "brotli",
            CompressionType::Zlib => "zlib",
            CompressionType::Flac => "flac",
            CompressionType::Ricepp => "ricepp",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CompressionType::None),
            "lzma" => Some(CompressionType::Lzma),
            "zstd" => Some(CompressionType::Zstd),
            "lz4" => Some(CompressionType::Lz4),
            "lz4hc" => Some(CompressionType::Lz4hc),
            "brotli" => Some(CompressionType::Brotli),
            "zlib" => Some(CompressionType::Zlib),
            "flac" => Some(CompressionType::Flac),
            "ricepp" => Some(CompressionType::Ricepp),
            _ => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SectionError {
    #[error("truncated section header: {offset} + {need} > {image_size}")]
    TruncatedHeader { offset: usize, need: usize, image_size: usize },
    #[error("truncated section data: {end} > {image_size}")]
    TruncatedData { end: u64, image_size: usize },
    #[error("offset/length overflow at section offset {0}")]
    OffsetOverflow(usize),
    #[error("invalid section magic at offset {0} — not a DWARFS image")]
    BadMagic(usize),
    #[error("unsupported section version {major}.{minor}")]
    BadVersion { major: u8, minor: u8 },
    #[error("bad section number: expected {expected}, got {got}")]
    BadSectionNumber { expected: u32, got: u32 },
    #[error("{kind} checksum mismatch in section {section_no}")]
    ChecksumMismatch { kind: ChecksumKind, section_no: u32 },
    /// Raised only when an unknown-typed section is *accessed*.
    #[error("unknown section type ({0})")]
    UnknownSectionType(u16),
    /// Raised only when a section with unknown compression is *accessed*.
    #[error("unknown compression type ({0})")]
    UnknownCompressionType(u16),
    #[error("invalid section index: {0}")]
    BadIndex(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Xxh3_64,
    Sha2_512_256,
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumKind::Xxh3_64 => write!(f, "xxh3-64"),
            ChecksumKind::Sha2_512_256 => write!(f, "sha2-512/256"),
        }
    }
}

// ── Verification levels ──────────────────────────────────────────────────────

/// How thoroughly [`Section::verify`] (and `Filesystem::check`) inspects a
/// section.  `Full` additionally decompresses the payload; that last step
/// needs a codec registry and lives in the reader façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyLevel {
    /// Header is well-formed (established at parse time).
    Fast,
    /// Recompute and compare xxh3_64.
    Checksum,
    /// Additionally recompute and compare SHA-512/256.
    Integrity,
    /// Additionally decompress the payload to exercise the codec.
    Full,
}

// memoized check state bits
const CHECKED_XXH3_PASS: u8 = 0x01;
const CHECKED_XXH3_FAIL: u8 = 0x02;
const CHECKED_SHA2_PASS: u8 = 0x04;
const CHECKED_SHA2_FAIL: u8 = 0x08;

// ── Section ──────────────────────────────────────────────────────────────────

/// One parsed section: header fields plus the payload location.
///
/// The payload itself is not copied; [`Section::data`] returns a view into
/// the image bytes.
#[derive(Debug)]
pub struct Section {
    /// Absolute offset of the section header within the image bytes.
    header_offset: usize,
    /// Absolute offset of the payload.
    start: usize,
    length: u64,
    raw_type: u16,
    raw_compression: u16,
    /// Header format version (1 or 2).
    version: u8,
    /// v2 only.
    number: Option<u32>,
    xxh3_64: Option<u64>,
    sha2_512_256: Option<[u8; SHA2_512_256_LEN]>,
    check_state: AtomicU8,
}

/// Result of [`parse_next`].
#[derive(Debug)]
pub enum ParseOutcome {
    Section(Section),
    EndOfImage,
}

/// Parse the section at `offset`, or report a clean end of image.
///
/// Validates magic, version, and `length` against the remaining image size,
/// including offset/length overflow.
pub fn parse_next(image: &[u8], offset: usize) -> Result<ParseOutcome, SectionError> {
    if offset == image.len() {
        return Ok(ParseOutcome::EndOfImage);
    }
    Section::parse_at(image, offset).map(ParseOutcome::Section)
}

impl Section {
    /// Parse a v1 or v2 header at `offset`.
    pub fn parse_at(image: &[u8], offset: usize) -> Result<Self, SectionError> {
        if offset + 8 > image.len() {
            return Err(SectionError::TruncatedHeader {
                offset,
                need: 8,
                image_size: image.len(),
            });
        }
        if &image[offset..offset + 6] != MAGIC {
            return Err(SectionError::BadMagic(offset));
        }
        let major = image[offset + 6];
        let minor = image[offset + 7];

        match major {
            1 => Self::parse_v1(image, offset, minor),
            2 => {
                if minor > MINOR_VERSION {
                    return Err(SectionError::BadVersion { major, minor });
                }
                Self::parse_v2(image, offset)
            }
            _ => Err(SectionError::BadVersion { major, minor }),
        }
    }

    fn parse_v1(image: &[u8], offset: usize, _minor: u8) -> Result<Self, SectionError> {
        let buf = header_bytes(image, offset, HEADER_V1_SIZE)?;
        let raw_type = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let raw_compression = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let length = u64::from_le_bytes(buf[12..20].try_into().unwrap());

        let start = validate_payload(image, offset, HEADER_V1_SIZE, length)?;

        Ok(Section {
            header_offset: offset,
            start,
            length,
            raw_type,
            raw_compression,
            version: 1,
            number: None,
            xxh3_64: None,
            sha2_512_256: None,
            check_state: AtomicU8::new(0),
        })
    }

    fn parse_v2(image: &[u8], offset: usize) -> Result<Self, SectionError> {
        let buf = header_bytes(image, offset, HEADER_V2_SIZE)?;
        let sha2_512_256: [u8; SHA2_512_256_LEN] = buf[8..40].try_into().unwrap();
        let xxh3_64 = u64::from_le_bytes(buf[40..48].try_into().unwrap());
        let number = u32::from_le_bytes(buf[48..52].try_into().unwrap());
        let raw_type = u16::from_le_bytes(buf[52..54].try_into().unwrap());
        let raw_compression = u16::from_le_bytes(buf[54..56].try_into().unwrap());
        let length = u64::from_le_bytes(buf[56..64].try_into().unwrap());

        let start = validate_payload(image, offset, HEADER_V2_SIZE, length)?;

        Ok(Section {
            header_offset: offset,
            start,
            length,
            raw_type,
            raw_compression,
            version: 2,
            number: Some(number),
            xxh3_64: Some(xxh3_64),
            sha2_512_256: Some(sha2_512_256),
            check_state: AtomicU8::new(0),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn header_offset(&self) -> usize {
        self.header_offset
    }

    /// Absolute offset of the payload within the image.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Absolute offset one past the payload.
    pub fn end(&self) -> usize {
        self.start + self.length as usize
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn number(&self) -> Option<u32> {
        self.number
    }

    pub fn raw_type(&self) -> u16 {
        self.raw_type
    }

    pub fn raw_compression(&self) -> u16 {
        self.raw_compression
    }

    pub fn section_type(&self) -> Option<SectionType> {
        SectionType::from_u16(self.raw_type)
    }

    pub fn compression(&self) -> Option<CompressionType> {
        CompressionType::from_u16(self.raw_compression)
    }

    pub fn is_known_type(&self) -> bool {
        self.section_type().is_some()
    }

    pub fn is_known_compression(&self) -> bool {
        self.compression().is_some()
    }

    /// Section type, or an error for unknown values.  Use at access time.
    pub fn checked_type(&self) -> Result<SectionType, SectionError> {
        self.section_type()
            .ok_or(SectionError::UnknownSectionType(self.raw_type))
    }

    /// Compression type, or an error for unknown values.  Use at access time.
    pub fn checked_compression(&self) -> Result<CompressionType, SectionError> {
        self.compression()
            .ok_or(SectionError::UnknownCompressionType(self.raw_compression))
    }

    pub fn name(&self) -> String {
        match self.section_type() {
            Some(t) => t.name().to_string(),
            None => format!("UNKNOWN ({})", self.raw_type),
        }
    }

    pub fn description(&self) -> String {
        let status = match self.check_state.load(Ordering::Relaxed) {
            s if s & (CHECKED_XXH3_FAIL | CHECKED_SHA2_FAIL) != 0 => "CHECKSUM ERROR",
            s if s & CHECKED_XXH3_PASS != 0 => "OK",
            _ => "unchecked",
        };
        format!(
            "{}, compression={}, length={}, offset={} [{}]",
            self.name(),
            self.compression()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| format!("unknown ({})", self.raw_compression)),
            self.length,
            self.header_offset,
            status,
        )
    }

    /// The payload bytes.
    pub fn data<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.start..self.end()]
    }

    // ── Verification ─────────────────────────────────────────────────────────

    /// Verify this section at `level`.  `Fast` always passes for a parsed
    /// section; `Full` is handled by the reader (it needs a codec).  v1
    /// sections have no integrity fields and pass every level vacuously.
    ///
    /// Results for `Checksum` and `Integrity` are memoized.
    pub fn verify(&self, image: &[u8], level: VerifyLevel) -> Result<(), SectionError> {
        if level == VerifyLevel::Fast || self.version == 1 {
            return Ok(());
        }

        self.verify_xxh3(image)?;

        if level >= VerifyLevel::Integrity {
            self.verify_sha2(image)?;
        }

        Ok(())
    }

    fn verify_xxh3(&self, image: &[u8]) -> Result<(), SectionError> {
        let state = self.check_state.load(Ordering::Acquire);
        if state & CHECKED_XXH3_PASS != 0 {
            return Ok(());
        }
        if state & CHECKED_XXH3_FAIL != 0 {
            return Err(self.mismatch(ChecksumKind::Xxh3_64));
        }

        let cover = &image[self.header_offset + XXH3_COVER_OFFSET..self.end()];
        let ok = xxh3_64_multi(&[cover]) == self.xxh3_64.unwrap_or(0);
        self.check_state.fetch_or(
            if ok { CHECKED_XXH3_PASS } else { CHECKED_XXH3_FAIL },
            Ordering::AcqRel,
        );
        if ok {
            Ok(())
        } else {
            Err(self.mismatch(ChecksumKind::Xxh3_64))
        }
    }

    fn verify_sha2(&self, image: &[u8]) -> Result<(), SectionError> {
        let state = self.check_state.load(Ordering::Acquire);
        if state & CHECKED_SHA2_PASS != 0 {
            return Ok(());
        }
        if state & CHECKED_SHA2_FAIL != 0 {
            return Err(self.mismatch(ChecksumKind::Sha2_512_256));
        }

        let cover = &image[self.header_offset + SHA2_COVER_OFFSET..self.end()];
        let ok = sha2_512_256_multi(&[cover]) == self.sha2_512_256.unwrap_or([0; 32]);
        self.check_state.fetch_or(
            if ok { CHECKED_SHA2_PASS } else { CHECKED_SHA2_FAIL },
            Ordering::AcqRel,
        );
        if ok {
            Ok(())
        } else {
            Err(self.mismatch(ChecksumKind::Sha2_512_256))
        }
    }

    fn mismatch(&self, kind: ChecksumKind) -> SectionError {
        SectionError::ChecksumMismatch {
            kind,
            section_no: self.number.unwrap_or(u32::MAX),
        }
    }
}

fn header_bytes<'a>(
    image: &'a [u8],
    offset: usize,
    size: usize,
) -> Result<&'a [u8], SectionError> {
    if offset + size > image.len() {
        return Err(SectionError::TruncatedHeader {
            offset,
            need: size,
            image_size: image.len(),
        });
    }
    Ok(&image[offset..offset + size])
}

fn validate_payload(
    image: &[u8],
    offset: usize,
    header_size: usize,
    length: u64,
) -> Result<usize, SectionError> {
    let start = offset + header_size;
    let end = (start as u64).checked_add(length).ok_or(SectionError::OffsetOverflow(offset))?;
    if end > image.len() as u64 {
        return Err(SectionError::TruncatedData {
            end,
            image_size: image.len(),
        });
    }
    Ok(start)
}

// ── Section index ────────────────────────────────────────────────────────────

/// Pack one index entry: `(type << 48) | offset`.
#[inline]
pub fn index_entry(section_type: u16, offset: u64) -> u64 {
    debug_assert!(offset < 1 << 48, "section offset exceeds 48 bits");
    (u64::from(section_type) << 48) | offset
}

/// Section type of an index entry.
#[inline]
pub fn index_entry_type(entry: u64) -> u16 {
    (entry >> 48) as u16
}

/// Offset of an index entry (relative to the first section header).
#[inline]
pub fn index_entry_offset(entry: u64) -> u64 {
    entry & ((1 << 48) - 1)
}

/// Locate and decode the section index from the tail of the image.
///
/// `base` is the offset of the first section header (the length of any
/// opaque image header); index entries are relative to it.  Returns `None`
/// if no plausible index is present — callers then fall back to a forward
/// scan.
pub fn read_section_index(image: &[u8], base: usize) -> Option<Vec<u64>> {
    if image.len() < base + HEADER_V2_SIZE + 8 {
        return None;
    }

    let tail = u64::from_le_bytes(image[image.len() - 8..].try_into().unwrap());
    if index_entry_type(tail) != SectionType::SectionIndex as u16 {
        return None;
    }

    let index_offset = base + index_entry_offset(tail) as usize;
    let section = Section::parse_at(image, index_offset).ok()?;
    if section.section_type() != Some(SectionType::SectionIndex)
        || section.compression() != Some(CompressionType::None)
        || section.length() % 8 != 0
        || section.end() != image.len()
    {
        return None;
    }

    let payload = section.data(image);
    let entries: Vec<u64> = payload
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    // The index's own entry must point back at itself.
    match entries.last() {
        Some(&e)
            if index_entry_type(e) == SectionType::SectionIndex as u16
                && base + index_entry_offset(e) as usize == index_offset =>
        {
            Some(entries)
        }
        _ => None,
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Emits sections with contiguous numbering and collects the section index.
///
/// `finalize` appends the index as the final section and must be called
/// exactly once; constructing further sections afterwards is a logic error.
pub struct SectionWriter<W: Write> {
    w: W,
    next_number: u32,
    /// Bytes emitted so far, which is also the offset of the next header.
    pos: u64,
    index: Vec<u64>,
    finalized: bool,
}

/// Location summary returned by [`SectionWriter::write_section`].
#[derive(Debug, Clone, Copy)]
pub struct SectionInfo {
    pub number: u32,
    pub offset: u64,
    pub payload_len: u64,
}

impl<W: Write> SectionWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            next_number: 0,
            pos: 0,
            index: Vec::new(),
            finalized: false,
        }
    }

    /// Append one section.  Assigns the next section number and computes
    /// both checksums over the assembled header tail plus payload.
    pub fn write_section(
        &mut self,
        section_type: SectionType,
        compression: CompressionType,
        payload: &[u8],
    ) -> io::Result<SectionInfo> {
        assert!(!self.finalized, "write_section after finalize");
        self.write_raw(section_type as u16, compression as u16, payload)
    }

    pub(crate) fn write_raw(
        &mut self,
        raw_type: u16,
        raw_compression: u16,
        payload: &[u8],
    ) -> io::Result<SectionInfo> {
        let number = self.next_number;
        let offset = self.pos;

        // Assemble the 16 header bytes after the integrity fields first;
        // both checksums cover them together with the payload.
        let mut tail = [0u8; 16];
        tail[0..4].copy_from_slice(&number.to_le_bytes());
        tail[4..6].copy_from_slice(&raw_type.to_le_bytes());
        tail[6..8].copy_from_slice(&raw_compression.to_le_bytes());
        tail[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());

        let xxh3 = xxh3_64_multi(&[&tail, payload]);

        let mut sha_cover_head = [0u8; 24];
        sha_cover_head[0..8].copy_from_slice(&xxh3.to_le_bytes());
        sha_cover_head[8..24].copy_from_slice(&tail);
        let sha = sha2_512_256_multi(&[&sha_cover_head, payload]);

        let mut header = [0u8; HEADER_V2_SIZE];
        header[0..6].copy_from_slice(MAGIC);
        header[6] = MAJOR_VERSION;
        header[7] = MINOR_VERSION;
        header[8..40].copy_from_slice(&sha);
        header[40..48].copy_from_slice(&xxh3.to_le_bytes());
        header[48..64].copy_from_slice(&tail);

        self.w.write_all(&header)?;
        self.w.write_all(payload)?;

        self.index.push(index_entry(raw_type, offset));
        self.next_number += 1;
        self.pos += (HEADER_V2_SIZE + payload.len()) as u64;

        Ok(SectionInfo {
            number,
            offset,
            payload_len: payload.len() as u64,
        })
    }

    /// Append the section index as the final section and flush.
    ///
    /// The index's own entry is part of its payload and points to its own
    /// header, so the payload size is known before it is written.
    pub fn finalize(mut self) -> io::Result<W> {
        assert!(!self.finalized, "finalize called twice");
        self.finalized = true;

        let own_offset = self.pos;
        self.index
            .push(index_entry(SectionType::SectionIndex as u16, own_offset));

        let mut payload = Vec::with_capacity(self.index.len() * 8);
        for &entry in &self.index {
            payload.extend_from_slice(&entry.to_le_bytes());
        }

        let info = self.write_raw(
            SectionType::SectionIndex as u16,
            CompressionType::None as u16,
            &payload,
        )?;
        debug_assert_eq!(info.offset, own_offset);

        self.w.flush()?;
        Ok(self.w)
    }

    pub fn next_section_number(&self) -> u32 {
        self.next_number
    }

    pub fn bytes_written(&self) -> u64 {
        self.pos
    }
}

// ── Image-level helpers ──────────────────────────────────────────────────────

/// Parse every section by scanning forward from `base` (the offset of the
/// first section header), validating that section numbers are contiguous
/// from 0.
pub fn scan_sections_from(image: &[u8], base: usize) -> Result<Vec<Section>, SectionError> {
    let mut sections = Vec::new();
    let mut offset = base;

    loop {
        match parse_next(image, offset)? {
            ParseOutcome::EndOfImage => break,
            ParseOutcome::Section(sec) => {
                if let Some(num) = sec.number() {
                    let expected = sections.len() as u32;
                    if num != expected {
                        return Err(SectionError::BadSectionNumber { expected, got: num });
                    }
                }
                offset = sec.end();
                sections.push(sec);
            }
        }
    }

    Ok(sections)
}

/// [`scan_sections_from`] with no opaque image header.
pub fn scan_sections(image: &[u8]) -> Result<Vec<Section>, SectionError> {
    scan_sections_from(image, 0)
}

/// Parse all sections, via the section index when one is present, falling
/// back to a forward scan.  Section numbers must be contiguous either way.
pub fn load_sections_from(image: &[u8], base: usize) -> Result<Vec<Section>, SectionError> {
    let Some(entries) = read_section_index(image, base) else {
        return scan_sections_from(image, base);
    };

    let mut sections = Vec::with_capacity(entries.len());
    for (i, &entry) in entries.iter().enumerate() {
        let sec = Section::parse_at(image, base + index_entry_offset(entry) as usize)?;
        if sec.raw_type() != index_entry_type(entry) {
            return Err(SectionError::BadIndex(format!(
                "index entry {} type mismatch: {} != {}",
                i,
                index_entry_type(entry),
                sec.raw_type()
            )));
        }
        if let Some(num) = sec.number() {
            if num != i as u32 {
                return Err(SectionError::BadSectionNumber {
                    expected: i as u32,
                    got: num,
                });
            }
        }
        sections.push(sec);
    }

    Ok(sections)
}

/// [`load_sections_from`] with no opaque image header.
pub fn load_sections(image: &[u8]) -> Result<Vec<Section>, SectionError> {
    load_sections_from(image, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_image() -> Vec<u8> {
        let mut sw = SectionWriter::new(Vec::new());
        sw.write_section(SectionType::Block, CompressionType::None, b"hello")
            .unwrap();
        sw.write_section(SectionType::Block, CompressionType::None, b"world!")
            .unwrap();
        sw.write_section(SectionType::MetadataV2, CompressionType::None, b"{}")
            .unwrap();
        sw.finalize().unwrap()
    }

    #[test]
    fn roundtrip_scan() {
        let img = small_image();
        let sections = scan_sections(&img).unwrap();
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].section_type(), Some(SectionType::Block));
        assert_eq!(sections[0].data(&img), b"hello");
        assert_eq!(sections[1].data(&img), b"world!");
        assert_eq!(sections[3].section_type(), Some(SectionType::SectionIndex));
    }

    #[test]
    fn index_resolves_every_section() {
        let img = small_image();
        let by_index = load_sections(&img).unwrap();
        let by_scan = scan_sections(&img).unwrap();
        assert_eq!(by_index.len(), by_scan.len());
        for (a, b) in by_index.iter().zip(by_scan.iter()) {
            assert_eq!(a.header_offset(), b.header_offset());
            assert_eq!(a.raw_type(), b.raw_type());
            assert_eq!(a.length(), b.length());
        }
    }

    #[test]
    fn verify_levels_pass() {
        let img = small_image();
        for sec in scan_sections(&img).unwrap() {
            sec.verify(&img, VerifyLevel::Fast).unwrap();
            sec.verify(&img, VerifyLevel::Checksum).unwrap();
            sec.verify(&img, VerifyLevel::Integrity).unwrap();
            // memoized second round
            sec.verify(&img, VerifyLevel::Integrity).unwrap();
        }
    }

    #[test]
    fn corruption_is_detected() {
        let mut img = small_image();
        let sections = scan_sections(&img).unwrap();
        let victim = sections[1].start();
        img[victim] ^= 0xFF;

        let sections = scan_sections(&img).unwrap();
        assert!(sections[0].verify(&img, VerifyLevel::Integrity).is_ok());
        let err = sections[1].verify(&img, VerifyLevel::Checksum).unwrap_err();
        assert!(matches!(
            err,
            SectionError::ChecksumMismatch { kind: ChecksumKind::Xxh3_64, section_no: 1 }
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut img = small_image();
        img[0] = b'X';
        assert!(matches!(
            Section::parse_at(&img, 0),
            Err(SectionError::BadMagic(0))
        ));
    }

    #[test]
    fn truncated_image_rejected() {
        let img = small_image();
        let cut = &img[..img.len() - 10];
        // The forward scan hits the truncated final section.
        assert!(scan_sections(cut).is_err());
        // The tail no longer decodes as an index entry.
        assert!(read_section_index(cut, 0).is_none());
    }

    #[test]
    fn unknown_type_tolerated_until_access() {
        let mut sw = SectionWriter::new(Vec::new());
        sw.write_raw(4242, CompressionType::None as u16, b"future data")
            .unwrap();
        let img = sw.finalize().unwrap();

        let sections = scan_sections(&img).unwrap();
        assert!(!sections[0].is_known_type());
        sections[0].verify(&img, VerifyLevel::Integrity).unwrap();
        assert!(matches!(
            sections[0].checked_type(),
            Err(SectionError::UnknownSectionType(4242))
        ));
    }

    #[test]
    fn index_entry_packing() {
        let e = index_entry(9, 0x1234_5678);
        assert_eq!(index_entry_type(e), 9);
        assert_eq!(index_entry_offset(e), 0x1234_5678);
    }
}
