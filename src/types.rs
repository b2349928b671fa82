//! Identifiers and file metadata shared across the crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a file in the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty file id".to_string());
        }
        if s.chars().any(char::is_whitespace) {
            return Err(format!("invalid file id: {s}"));
        }
        Ok(Self(s.to_string()))
    }
}

/// Session identifier carried in the connection preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of the mover started on the source pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoverId(pub u32);

impl fmt::Display for MoverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Storage metadata returned by the namespace service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub size: u64,
    pub storage_class: String,
    /// Free-form key/value flags attached by the namespace.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

impl StorageInfo {
    /// Key marking a file as sticky in the namespace.
    pub const STICKY_KEY: &'static str = "flag-s";

    pub fn new(size: u64, storage_class: impl Into<String>) -> Self {
        Self {
            size,
            storage_class: storage_class.into(),
            keys: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(key.into(), value.into());
        self
    }

    pub fn key(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    /// Whether the namespace asks for new replicas to be pinned.
    pub fn is_sticky(&self) -> bool {
        self.key(Self::STICKY_KEY).is_some_and(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_parse() {
        let id: FileId = " 0000A1B2C3 ".parse().unwrap();
        assert_eq!(id.as_str(), "0000A1B2C3");
        assert!("".parse::<FileId>().is_err());
        assert!("a b".parse::<FileId>().is_err());
    }

    #[test]
    fn test_sticky_key() {
        let info = StorageInfo::new(10, "test:disk");
        assert!(!info.is_sticky());
        assert!(!info.clone().with_key("flag-s", "").is_sticky());
        assert!(info.with_key("flag-s", "yes").is_sticky());
    }
}
