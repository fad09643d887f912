//! Checksum and hash helpers.
//!
//! Two distinct concerns share this module:
//!
//! - **Section integrity**: every v2 section header carries an XXH3-64
//!   checksum (fast verification) and a SHA-512/256 digest (integrity
//!   verification).  See `section.rs` for exactly which bytes each covers.
//! - **Scanner content hashing**: the file scanner identifies duplicate
//!   files by a user-selected [`HashAlgorithm`].  BLAKE3 is the default;
//!   `None` disables content dedup entirely (hardlink grouping remains).

use sha2::{Digest, Sha512_256};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

/// Byte length of the SHA-512/256 digest stored in a v2 section header.
pub const SHA2_512_256_LEN: usize = 32;

/// XXH3-64 over a contiguous buffer.
#[inline]
pub fn xxh3_64_of(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// XXH3-64 over several buffers, hashed as one stream.
pub fn xxh3_64_multi(parts: &[&[u8]]) -> u64 {
    let mut h = Xxh3::new();
    for p in parts {
        h.update(p);
    }
    h.digest()
}

/// SHA-512/256 over several buffers, hashed as one stream.
pub fn sha2_512_256_multi(parts: &[&[u8]]) -> [u8; SHA2_512_256_LEN] {
    let mut h = Sha512_256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

// ── Scanner content hashing ──────────────────────────────────────────────────

/// Content hash algorithm used for file deduplication.
///
/// `None` disables content-based dedup; files are then grouped by raw inode
/// number only (hardlinks are still honored).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Xxh3_64,
    Sha2_512_256,
    None,
}

impl HashAlgorithm {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "blake3" => Some(HashAlgorithm::Blake3),
            "xxh3-64" => Some(HashAlgorithm::Xxh3_64),
            "sha2-512-256" => Some(HashAlgorithm::Sha2_512_256),
            "none" => Some(HashAlgorithm::None),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Xxh3_64 => "xxh3-64",
            HashAlgorithm::Sha2_512_256 => "sha2-512-256",
            HashAlgorithm::None => "none",
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, HashAlgorithm::None)
    }

    /// Digest `data`, returning the raw hash bytes.
    ///
    /// Must not be called for `HashAlgorithm::None`; the scanner never
    /// hashes in that configuration.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
            HashAlgorithm::Xxh3_64 => xxh3_64(data).to_le_bytes().to_vec(),
            HashAlgorithm::Sha2_512_256 => sha2_512_256_multi(&[data]).to_vec(),
            HashAlgorithm::None => unreachable!("digest() with hash algorithm 'none'"),
        }
    }

    /// Hex digest, for diagnostics and `dump` output.
    pub fn digest_hex(self, data: &[u8]) -> String {
        hex::encode(self.digest(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(xxh3_64_multi(&[&data[..10], &data[10..]]), xxh3_64_of(data));
        assert_eq!(
            sha2_512_256_multi(&[&data[..7], &data[7..]]),
            sha2_512_256_multi(&[data])
        );
    }

    #[test]
    fn algorithms_disagree() {
        let data = b"dwarfs";
        let b3 = HashAlgorithm::Blake3.digest(data);
        let xx = HashAlgorithm::Xxh3_64.digest(data);
        let sh = HashAlgorithm::Sha2_512_256.digest(data);
        assert_eq!(b3.len(), 32);
        assert_eq!(xx.len(), 8);
        assert_eq!(sh.len(), 32);
        assert_ne!(b3, sh);
    }

    #[test]
    fn name_roundtrip() {
        for algo in [
            HashAlgorithm::Blake3,
            HashAlgorithm::Xxh3_64,
            HashAlgorithm::Sha2_512_256,
            HashAlgorithm::None,
        ] {
            assert_eq!(HashAlgorithm::from_name(algo.name()), Some(algo));
        }
        assert_eq!(HashAlgorithm::from_name("md5"), None);
    }
}
