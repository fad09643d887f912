//! History section payload.
//!
//! A `HISTORY` section holds a JSON array of versioned entries, one per
//! build or rewrite.  The section is non-essential: checksum failures on
//! it are reported but never fatal, and rewriters carry the old entries
//! forward before appending their own.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Library version that produced the image (e.g. `dwarfs-0.5.0`).
    pub version: String,
    /// Unix timestamp of the operation.
    pub timestamp: i64,
    /// Command line (or equivalent) that triggered it.
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct History {
    pub entries: Vec<HistoryEntry>,
}

impl History {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("history serialization cannot fail")
    }

    /// Append an entry stamped with the current time.
    pub fn append_now(&mut self, arguments: Vec<String>) {
        self.entries.push(HistoryEntry {
            version: concat!("dwarfs-", env!("CARGO_PKG_VERSION")).to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            arguments,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut h = History::default();
        h.append_now(vec!["--recompress".into()]);
        h.append_now(vec![]);
        let bytes = h.to_bytes();
        let back = History::parse(&bytes).unwrap();
        assert_eq!(back, h);
        assert_eq!(back.entries.len(), 2);
    }

    #[test]
    fn garbage_is_tolerated() {
        assert!(History::parse(b"\xff\xfe not json").is_none());
    }
}
