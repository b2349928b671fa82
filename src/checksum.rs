//! Streaming checksums computed while a replica is received.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

/// Digest used for on-the-fly transfer verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    #[default]
    Xxh3,
    Blake3,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Xxh3 => "xxh3",
            ChecksumType::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished checksum value, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub kind: ChecksumType,
    pub value: String,
}

impl Checksum {
    /// One-shot digest of a buffer.
    pub fn compute(kind: ChecksumType, data: &[u8]) -> Self {
        let mut hasher = Checksummer::new(kind);
        hasher.update(data);
        hasher.finish()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Incremental hasher fed with every received data block.
pub enum Checksummer {
    Xxh3(Box<Xxh3>),
    Blake3(Box<blake3::Hasher>),
}

impl Checksummer {
    pub fn new(kind: ChecksumType) -> Self {
        match kind {
            ChecksumType::Xxh3 => Checksummer::Xxh3(Box::new(Xxh3::new())),
            ChecksumType::Blake3 => Checksummer::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksummer::Xxh3(h) => h.update(data),
            Checksummer::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finish(self) -> Checksum {
        match self {
            Checksummer::Xxh3(h) => Checksum {
                kind: ChecksumType::Xxh3,
                value: hex::encode(h.digest().to_be_bytes()),
            },
            Checksummer::Blake3(h) => Checksum {
                kind: ChecksumType::Blake3,
                value: hex::encode(h.finalize().as_bytes()),
            },
        }
    }
}

impl fmt::Debug for Checksummer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksummer::Xxh3(_) => f.write_str("Checksummer(xxh3)"),
            Checksummer::Blake3(_) => f.write_str("Checksummer(blake3)"),
        }
    }
}
