//! Interface to the local replica repository of the destination pool.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::RepositoryError;
use crate::types::{FileId, StorageInfo};

/// Lifecycle state of a replica in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Provisional state while the replica is being pulled from another pool
    FromPool,
    Cached,
    Precious,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplicaState::FromPool => "FROM_POOL",
            ReplicaState::Cached => "CACHED",
            ReplicaState::Precious => "PRECIOUS",
        })
    }
}

/// Pin protecting a replica from garbage collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    /// `None` pins the replica forever
    pub expires: Option<DateTime<Utc>>,
}

impl StickyRecord {
    pub fn new(owner: impl Into<String>, expires: Option<DateTime<Utc>>) -> Self {
        Self {
            owner: owner.into(),
            expires,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(true, |t| t > now)
    }
}

/// Everything the repository needs to create a new replica entry.
#[derive(Debug, Clone)]
pub struct ReplicaSpec {
    pub file_id: FileId,
    pub storage_info: StorageInfo,
    pub provisional_state: ReplicaState,
    pub target_state: ReplicaState,
    pub sticky: Vec<StickyRecord>,
}

/// Scoped permission and space to write one new replica.
///
/// Callers finish with either `commit` then `close`, or `close` alone, which
/// discards the replica.
#[async_trait]
pub trait WriteHandle: Send {
    /// Reserve `bytes` of pool space for the replica.
    async fn allocate(&mut self, bytes: u64) -> Result<(), RepositoryError>;

    /// Data file the replica content is written to.
    fn file_path(&self) -> &Path;

    fn set_checksum(&mut self, checksum: Checksum);

    /// Move the replica to its target state.
    async fn commit(&mut self) -> Result<(), RepositoryError>;

    /// Release the handle; an uncommitted replica is removed.
    async fn close(&mut self);
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_replica(
        &self,
        spec: ReplicaSpec,
    ) -> Result<Box<dyn WriteHandle>, RepositoryError>;
}
