//! Codec registry — compression-type dispatch for section payloads.
//!
//! # Payload framing
//!
//! Every compressed payload is `uleb128(uncompressed_size)` followed by the
//! raw codec stream.  `NONE` payloads are stored verbatim with no prefix.
//! The prefix lets a reader size its output buffer (and the cache report
//! `uncompressed_size()`) without consulting the codec.
//!
//! # Dispatch rules
//!
//! Compression types are a closed on-disk set (`section.rs`); which of them
//! can be *decoded* depends on this registry.  Built-ins cover `NONE`,
//! `ZSTD`, `LZ4`, `LZ4HC`, `BROTLI` and `LZMA`.  `ZLIB`, `FLAC` and
//! `RICEPP` are recognized types whose codecs are external; a payload using
//! one of them fails with [`CodecError::UnavailableCodec`] when accessed —
//! never earlier, so images using exotic codecs can still be listed and
//! checked.  There is no fallback and no negotiation.
//!
//! # Incremental decompression
//!
//! [`Decompressor`] decodes in frames so the block cache can stop once a
//! request's range is covered.  Streaming codecs (zstd, brotli) honor the
//! requested frame size; one-shot codecs (lz4, lzma) decode everything on
//! the first frame and report completion.  Decompression is deterministic:
//! the same payload always yields byte-identical output.

pub mod requirements;

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::image::ImageData;
use crate::section::CompressionType;

pub use requirements::{CompressionConstraints, Requirements};

/// Default frame size used when draining a decompressor to completion.
pub const DEFAULT_FRAME_SIZE: usize = 64 * 1024;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    /// `bad_input`: the encoder rejected its input.
    #[error("compression error: {0}")]
    Compression(String),
    /// `bad_compression`: the payload could not be decoded.
    #[error("decompression error: {0}")]
    Decompression(String),
    /// The compression type is known but no codec for it is registered.
    /// Decoding MUST NOT continue; there is no fallback.
    #[error("compression type '{0}' is not available in this build")]
    UnavailableCodec(&'static str),
    #[error("invalid metadata requirements: {0}")]
    BadRequirements(String),
    /// Per-fragment metadata failed a codec's requirement schema.
    #[error("metadata mismatch: {0}")]
    MetadataMismatch(String),
    #[error("truncated payload: missing uncompressed-size prefix")]
    TruncatedPayload,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Varint prefix ────────────────────────────────────────────────────────────

/// Append `v` as ULEB128.
pub fn write_uleb128(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a ULEB128 value; returns `(value, bytes_consumed)`.
pub fn read_uleb128(data: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut v = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return Err(CodecError::Decompression("varint overflow".into()));
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((v, i + 1));
        }
        shift += 7;
    }
    Err(CodecError::TruncatedPayload)
}

// ── Payload reference ────────────────────────────────────────────────────────

/// A borrowed-by-Arc view of one section payload.  Keeps the image mapping
/// alive for as long as a decompressor needs it.
#[derive(Clone)]
pub struct PayloadRef {
    image: Arc<ImageData>,
    start: usize,
    len: usize,
}

impl PayloadRef {
    pub fn new(image: Arc<ImageData>, start: usize, len: usize) -> Self {
        debug_assert!(start + len <= image.len());
        Self { image, start, len }
    }

    /// Wrap owned bytes (tests, rewrite staging).
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            image: ImageData::from_vec(data),
            start: 0,
            len,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.image.as_slice()[self.start..self.start + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hint the OS to drop the source pages backing this payload.
    pub fn release_pages(&self) {
        self.image.release_range(self.start, self.len);
    }

    fn slice(&self, from: usize) -> PayloadRef {
        PayloadRef {
            image: Arc::clone(&self.image),
            start: self.start + from,
            len: self.len - from,
        }
    }
}

/// `Read` adapter over a [`PayloadRef`] for streaming decoders.
struct PayloadReader {
    payload: PayloadRef,
    pos: usize,
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let src = &self.payload.bytes()[self.pos..];
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        self.pos += n;
        Ok(n)
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

/// One codec: whole-payload compression plus incremental decompression.
///
/// `compress` receives and produces raw codec streams; the varint framing
/// is applied by the registry.
pub trait Codec: Send + Sync {
    fn compression(&self) -> CompressionType;

    fn compress(
        &self,
        data: &[u8],
        level: i32,
        metadata: Option<&Value>,
    ) -> Result<Vec<u8>, CodecError>;

    /// Create a decompressor over the raw codec stream (prefix stripped).
    /// `uncompressed_size` comes from the varint prefix.
    fn decompressor(
        &self,
        payload: PayloadRef,
        uncompressed_size: usize,
    ) -> Result<Box<dyn Decompressor>, CodecError>;

    /// Schema the per-category metadata must satisfy, if any.
    fn metadata_requirements(&self) -> Option<Requirements> {
        None
    }

    /// Constraints derived from category metadata (granularity).
    fn compression_constraints(
        &self,
        _metadata: Option<&Value>,
    ) -> Result<CompressionConstraints, CodecError> {
        Ok(CompressionConstraints::default())
    }
}

/// Incremental decoder for one payload.
pub trait Decompressor: Send {
    /// Total uncompressed size, known up front.
    fn uncompressed_size(&self) -> usize;

    /// Decode up to `frame_size` further bytes, appending to `out`.
    /// Returns `true` once the payload is fully decoded.
    fn decompress_frame(&mut self, out: &mut Vec<u8>, frame_size: usize)
        -> Result<bool, CodecError>;
}

impl std::fmt::Debug for dyn Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Decompressor").finish_non_exhaustive()
    }
}

// ── Built-in codecs ──────────────────────────────────────────────────────────

struct ZstdCodec;

impl Codec for ZstdCodec {
    fn compression(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn compress(&self, data: &[u8], level: i32, _: Option<&Value>) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompressor(
        &self,
        payload: PayloadRef,
        uncompressed_size: usize,
    ) -> Result<Box<dyn Decompressor>, CodecError> {
        let reader = PayloadReader { payload, pos: 0 };
        let decoder = zstd::stream::read::Decoder::new(reader)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(Box::new(StreamingDecompressor {
            reader: Box::new(decoder),
            uncompressed_size,
            produced: 0,
        }))
    }
}

struct BrotliCodec;

impl Codec for BrotliCodec {
    fn compression(&self) -> CompressionType {
        CompressionType::Brotli
    }

    fn compress(&self, data: &[u8], level: i32, _: Option<&Value>) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }

    fn decompressor(
        &self,
        payload: PayloadRef,
        uncompressed_size: usize,
    ) -> Result<Box<dyn Decompressor>, CodecError> {
        let reader = PayloadReader { payload, pos: 0 };
        Ok(Box::new(StreamingDecompressor {
            reader: Box::new(brotli::Decompressor::new(reader, 4096)),
            uncompressed_size,
            produced: 0,
        }))
    }
}

struct Lz4Codec {
    high_compression: bool,
}

impl Codec for Lz4Codec {
    fn compression(&self) -> CompressionType {
        if self.high_compression {
            CompressionType::Lz4hc
        } else {
            CompressionType::Lz4
        }
    }

    fn compress(&self, data: &[u8], _: i32, _: Option<&Value>) -> Result<Vec<u8>, CodecError> {
        // lz4_flex has a single encoder; LZ4 and LZ4HC stay distinct types
        // on disk so the rewriter can tell them apart.
        Ok(lz4_flex::block::compress(data))
    }

    fn decompressor(
        &self,
        payload: PayloadRef,
        uncompressed_size: usize,
    ) -> Result<Box<dyn Decompressor>, CodecError> {
        Ok(Box::new(OneShotDecompressor::Lz4 {
            payload,
            uncompressed_size,
            done: false,
        }))
    }
}

struct LzmaCodec;

impl Codec for LzmaCodec {
    fn compression(&self) -> CompressionType {
        CompressionType::Lzma
    }

    fn compress(&self, data: &[u8], _: i32, _: Option<&Value>) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }

    fn decompressor(
        &self,
        payload: PayloadRef,
        uncompressed_size: usize,
    ) -> Result<Box<dyn Decompressor>, CodecError> {
        Ok(Box::new(OneShotDecompressor::Lzma {
            payload,
            uncompressed_size,
            done: false,
        }))
    }
}

/// Streaming decoders (zstd, brotli) honor the requested frame size.
struct StreamingDecompressor {
    reader: Box<dyn Read + Send>,
    uncompressed_size: usize,
    produced: usize,
}

impl Decompressor for StreamingDecompressor {
    fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    fn decompress_frame(
        &mut self,
        out: &mut Vec<u8>,
        frame_size: usize,
    ) -> Result<bool, CodecError> {
        let want = frame_size.min(self.uncompressed_size - self.produced);
        let start = out.len();
        out.resize(start + want, 0);

        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut out[start + filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    out.truncate(start);
                    return Err(CodecError::Decompression(e.to_string()));
                }
            }
        }
        out.truncate(start + filled);
        self.produced += filled;

        if filled < want {
            return Err(CodecError::Decompression(format!(
                "stream ended early: {} of {} bytes",
                self.produced, self.uncompressed_size
            )));
        }
        Ok(self.produced == self.uncompressed_size)
    }
}

/// One-shot decoders (lz4, lzma) decode everything on the first frame.
enum OneShotDecompressor {
    Lz4 {
        payload: PayloadRef,
        uncompressed_size: usize,
        done: bool,
    },
    Lzma {
        payload: PayloadRef,
        uncompressed_size: usize,
        done: bool,
    },
}

impl Decompressor for OneShotDecompressor {
    fn uncompressed_size(&self) -> usize {
        match self {
            OneShotDecompressor::Lz4 { uncompressed_size, .. }
            | OneShotDecompressor::Lzma { uncompressed_size, .. } => *uncompressed_size,
        }
    }

    fn decompress_frame(&mut self, out: &mut Vec<u8>, _: usize) -> Result<bool, CodecError> {
        match self {
            OneShotDecompressor::Lz4 {
                payload,
                uncompressed_size,
                done,
            } => {
                if !*done {
                    let decoded = lz4_flex::block::decompress(payload.bytes(), *uncompressed_size)
                        .map_err(|e| CodecError::Decompression(e.to_string()))?;
                    if decoded.len() != *uncompressed_size {
                        return Err(CodecError::Decompression(format!(
                            "lz4 produced {} of {} bytes",
                            decoded.len(),
                            uncompressed_size
                        )));
                    }
                    out.extend_from_slice(&decoded);
                    *done = true;
                }
                Ok(true)
            }
            OneShotDecompressor::Lzma {
                payload,
                uncompressed_size,
                done,
            } => {
                if !*done {
                    let before = out.len();
                    lzma_rs::lzma_decompress(&mut io::Cursor::new(payload.bytes()), out)
                        .map_err(|e| CodecError::Decompression(e.to_string()))?;
                    if out.len() - before != *uncompressed_size {
                        let got = out.len() - before;
                        out.truncate(before);
                        return Err(CodecError::Decompression(format!(
                            "lzma produced {got} of {uncompressed_size} bytes"
                        )));
                    }
                    *done = true;
                }
                Ok(true)
            }
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Compression-type → codec table.
///
/// Built once (registration happens before any image is opened), then shared
/// immutably behind an `Arc`.
pub struct Registry {
    codecs: BTreeMap<u16, Box<dyn Codec>>,
}

impl Registry {
    /// The built-in codec set: zstd, lz4, lz4hc, brotli, lzma.
    pub fn with_builtin() -> Self {
        let mut r = Registry {
            codecs: BTreeMap::new(),
        };
        r.register(Box::new(ZstdCodec));
        r.register(Box::new(Lz4Codec { high_compression: false }));
        r.register(Box::new(Lz4Codec { high_compression: true }));
        r.register(Box::new(BrotliCodec));
        r.register(Box::new(LzmaCodec));
        r
    }

    /// Register (or replace) a codec.  Call before sharing the registry.
    pub fn register(&mut self, codec: Box<dyn Codec>) {
        self.codecs.insert(codec.compression() as u16, codec);
    }

    pub fn is_available(&self, compression: CompressionType) -> bool {
        compression == CompressionType::None
            || self.codecs.contains_key(&(compression as u16))
    }

    fn codec(&self, compression: CompressionType) -> Result<&dyn Codec, CodecError> {
        self.codecs
            .get(&(compression as u16))
            .map(Box::as_ref)
            .ok_or(CodecError::UnavailableCodec(compression.name()))
    }

    /// Metadata requirement schema for a compression type, if any.
    pub fn metadata_requirements(
        &self,
        compression: CompressionType,
    ) -> Result<Option<Requirements>, CodecError> {
        if compression == CompressionType::None {
            return Ok(None);
        }
        Ok(self.codec(compression)?.metadata_requirements())
    }

    /// Compression constraints (granularity) for a compression type.
    pub fn compression_constraints(
        &self,
        compression: CompressionType,
        metadata: Option<&Value>,
    ) -> Result<CompressionConstraints, CodecError> {
        if compression == CompressionType::None {
            return Ok(CompressionConstraints::default());
        }
        self.codec(compression)?.compression_constraints(metadata)
    }

    /// Compress `data` into a framed section payload.
    ///
    /// The codec's metadata requirements are checked first; mismatches fail
    /// before any compression work is done.  `NONE` stores verbatim.
    pub fn compress_payload(
        &self,
        compression: CompressionType,
        data: &[u8],
        level: i32,
        metadata: Option<&Value>,
    ) -> Result<Vec<u8>, CodecError> {
        if compression == CompressionType::None {
            return Ok(data.to_vec());
        }
        let codec = self.codec(compression)?;
        if let Some(req) = codec.metadata_requirements() {
            req.check(metadata)?;
        }
        let stream = codec.compress(data, level, metadata)?;
        let mut out = Vec::with_capacity(stream.len() + 10);
        write_uleb128(&mut out, data.len() as u64);
        out.extend_from_slice(&stream);
        Ok(out)
    }

    /// Uncompressed size of a framed payload without decoding it.
    pub fn uncompressed_size(
        &self,
        compression: CompressionType,
        payload: &[u8],
    ) -> Result<usize, CodecError> {
        if compression == CompressionType::None {
            return Ok(payload.len());
        }
        let (size, _) = read_uleb128(payload)?;
        Ok(size as usize)
    }

    /// Create an incremental decompressor over a framed payload.
    pub fn decompressor(
        &self,
        compression: CompressionType,
        payload: PayloadRef,
    ) -> Result<Box<dyn Decompressor>, CodecError> {
        if compression == CompressionType::None {
            let len = payload.len();
            return Ok(Box::new(VerbatimDecompressor {
                payload,
                produced: 0,
                uncompressed_size: len,
            }));
        }
        let (size, consumed) = read_uleb128(payload.bytes())?;
        self.codec(compression)?
            .decompressor(payload.slice(consumed), size as usize)
    }

    /// Decode a framed payload to completion (metadata sections, `check`).
    pub fn decompress_payload(
        &self,
        compression: CompressionType,
        payload: PayloadRef,
    ) -> Result<Vec<u8>, CodecError> {
        let mut d = self.decompressor(compression, payload)?;
        let mut out = Vec::with_capacity(d.uncompressed_size());
        while !d.decompress_frame(&mut out, DEFAULT_FRAME_SIZE)? {}
        Ok(out)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// `NONE` "decompressor" for completeness; the cache bypasses it.
struct VerbatimDecompressor {
    payload: PayloadRef,
    produced: usize,
    uncompressed_size: usize,
}

impl Decompressor for VerbatimDecompressor {
    fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    fn decompress_frame(
        &mut self,
        out: &mut Vec<u8>,
        frame_size: usize,
    ) -> Result<bool, CodecError> {
        let want = frame_size.min(self.uncompressed_size - self.produced);
        out.extend_from_slice(&self.payload.bytes()[self.produced..self.produced + want]);
        self.produced += want;
        Ok(self.produced == self.uncompressed_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Vec<u8> {
        // Compressible but not trivial.
        (0u32..20_000)
            .flat_map(|i| ((i.wrapping_mul(2654435761)) >> 8).to_le_bytes())
            .collect()
    }

    #[test]
    fn uleb128_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_uleb128(&mut buf, v);
            let (decoded, used) = read_uleb128(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn uleb128_truncated() {
        assert!(matches!(
            read_uleb128(&[0x80, 0x80]),
            Err(CodecError::TruncatedPayload)
        ));
    }

    #[test]
    fn roundtrip_all_builtin() {
        let reg = Registry::with_builtin();
        let data = sample_data();
        for ct in [
            CompressionType::Zstd,
            CompressionType::Lz4,
            CompressionType::Lz4hc,
            CompressionType::Brotli,
            CompressionType::Lzma,
            CompressionType::None,
        ] {
            let payload = reg.compress_payload(ct, &data, 3, None).unwrap();
            assert_eq!(reg.uncompressed_size(ct, &payload).unwrap(), data.len());
            let back = reg
                .decompress_payload(ct, PayloadRef::from_vec(payload))
                .unwrap();
            assert_eq!(back, data, "codec {}", ct.name());
        }
    }

    #[test]
    fn incremental_prefix_decode() {
        let reg = Registry::with_builtin();
        let data = sample_data();
        let payload = reg
            .compress_payload(CompressionType::Zstd, &data, 3, None)
            .unwrap();

        let mut d = reg
            .decompressor(CompressionType::Zstd, PayloadRef::from_vec(payload))
            .unwrap();
        assert_eq!(d.uncompressed_size(), data.len());

        let mut out = Vec::new();
        let done = d.decompress_frame(&mut out, 1000).unwrap();
        assert!(!done);
        assert_eq!(out.len(), 1000);
        assert_eq!(&out[..], &data[..1000]);

        while !d.decompress_frame(&mut out, 8192).unwrap() {}
        assert_eq!(out, data);
    }

    #[test]
    fn unavailable_codec_fails_hard() {
        let reg = Registry::with_builtin();
        assert!(!reg.is_available(CompressionType::Flac));
        let err = reg
            .decompressor(
                CompressionType::Flac,
                PayloadRef::from_vec(vec![0x04, 1, 2, 3, 4]),
            )
            .unwrap_err();
        assert!(matches!(err, CodecError::UnavailableCodec("flac")));
    }

    #[test]
    fn corrupt_stream_reports_bad_compression() {
        let reg = Registry::with_builtin();
        let data = sample_data();
        let mut payload = reg
            .compress_payload(CompressionType::Zstd, &data, 3, None)
            .unwrap();
        let mid = payload.len() / 2;
        payload[mid] ^= 0xA5;
        payload[mid + 1] ^= 0xA5;
        let res = reg.decompress_payload(CompressionType::Zstd, PayloadRef::from_vec(payload));
        assert!(matches!(res, Err(CodecError::Decompression(_))));
    }

    #[test]
    fn requirements_checked_before_compression() {
        struct PickyCodec;
        impl Codec for PickyCodec {
            fn compression(&self) -> CompressionType {
                CompressionType::Zlib
            }
            fn compress(
                &self,
                data: &[u8],
                _: i32,
                _: Option<&Value>,
            ) -> Result<Vec<u8>, CodecError> {
                Ok(data.to_vec())
            }
            fn decompressor(
                &self,
                payload: PayloadRef,
                uncompressed_size: usize,
            ) -> Result<Box<dyn Decompressor>, CodecError> {
                Ok(Box::new(VerbatimDecompressor {
                    payload,
                    produced: 0,
                    uncompressed_size,
                }))
            }
            fn metadata_requirements(&self) -> Option<Requirements> {
                Some(Requirements::parse_str(r#"{"window": ["range", 9, 15]}"#).unwrap())
            }
        }

        let mut reg = Registry::with_builtin();
        reg.register(Box::new(PickyCodec));

        let err = reg
            .compress_payload(CompressionType::Zlib, b"abc", 0, None)
            .unwrap_err();
        assert!(matches!(err, CodecError::MetadataMismatch(_)));

        let md = serde_json::json!({"window": 12});
        reg.compress_payload(CompressionType::Zlib, b"abc", 0, Some(&md))
            .unwrap();
    }
}
