//! Asynchronous request/reply endpoints of the surrounding system.
//!
//! The namespace service and the source pool are reached through message
//! passing; these traits are the seams the companion talks through.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CoordinationError;
use crate::repository::Repository;
use crate::types::{FileId, MoverId, SessionId, StorageInfo};

#[async_trait]
pub trait NamespaceService: Send + Sync {
    async fn storage_info(&self, file_id: &FileId) -> Result<StorageInfo, CoordinationError>;
}

/// Delivery request asking a source pool to push a replica to us.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub source_pool: String,
    pub file_id: FileId,
    pub storage_info: StorageInfo,
    /// Address the source mover connects back to
    pub callback: SocketAddr,
    pub session: SessionId,
    /// `pool:<name>` of the requesting pool
    pub initiator: String,
}

/// Control channel to remote pools.
#[async_trait]
pub trait PoolStub: Send + Sync {
    /// Ask the source pool to start a mover; resolves once it has started.
    async fn request_push(&self, request: PushRequest) -> Result<MoverId, CoordinationError>;

    async fn cancel_push(
        &self,
        pool: &str,
        mover: MoverId,
        cause: &str,
    ) -> Result<(), CoordinationError>;

    /// Liveness check for a started mover.
    async fn ping_mover(&self, pool: &str, mover: MoverId) -> Result<(), CoordinationError>;
}

/// Unsolicited notifications sent by source pools.
#[derive(Debug, Clone)]
pub enum PoolMessage {
    /// The source mover finished; `Err` carries the mover's failure.
    TransferFinished {
        session: SessionId,
        result: Result<(), CoordinationError>,
    },
}

impl PoolMessage {
    pub fn session(&self) -> SessionId {
        match self {
            PoolMessage::TransferFinished { session, .. } => *session,
        }
    }
}

/// Collaborators every transfer talks to.
#[derive(Clone)]
pub struct Services {
    pub namespace: Arc<dyn NamespaceService>,
    pub pool: Arc<dyn PoolStub>,
    pub repository: Arc<dyn Repository>,
}
