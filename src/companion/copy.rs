//! Bulk copy of one replica, run on its own task.

use std::io;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checksum::ChecksumType;
use crate::error::{Result, TransferError};
use crate::repository::{ReplicaSpec, ReplicaState, Repository, StickyRecord, WriteHandle};
use crate::streaming::{ReceiveReport, Receiver, ReceiverConfig};
use crate::types::{FileId, StorageInfo};

/// Owner of the pin added for files the namespace marks sticky
const SYSTEM_STICKY_OWNER: &str = "system";

pub(crate) struct CopyJob {
    pub file_id: FileId,
    pub storage_info: StorageInfo,
    pub target_state: ReplicaState,
    pub sticky: Vec<StickyRecord>,
    pub repository: Arc<dyn Repository>,
    pub checksum: Option<ChecksumType>,
    pub buffer_size: usize,
    pub simulate_io_failure: bool,
    pub progress: Arc<AtomicU64>,
}

impl CopyJob {
    fn replica_spec(&self) -> ReplicaSpec {
        let mut sticky = self.sticky.clone();
        if self.storage_info.is_sticky() {
            debug!(file_id = %self.file_id, "setting sticky bit");
            sticky.push(StickyRecord::new(SYSTEM_STICKY_OWNER, None));
        }
        ReplicaSpec {
            file_id: self.file_id.clone(),
            storage_info: self.storage_info.clone(),
            provisional_state: ReplicaState::FromPool,
            target_state: self.target_state,
            sticky,
        }
    }

    /// Create the replica, fill it from `stream` and commit it.
    ///
    /// The write handle is always closed; anything short of a commit
    /// discards the replica.
    pub async fn run(self, mut stream: TcpStream, token: CancellationToken) -> Result<ReceiveReport> {
        let mut handle = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(interrupted()),
            handle = self.repository.create_replica(self.replica_spec()) => handle?,
        };

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => Err(interrupted()),
            written = self.write_replica(handle.as_mut(), &mut stream) => written,
        };

        let outcome = match written {
            Ok(report) => handle
                .commit()
                .await
                .map(|()| report)
                .map_err(TransferError::from),
            Err(e) => Err(e),
        };
        handle.close().await;
        outcome
    }

    async fn write_replica(
        &self,
        handle: &mut dyn WriteHandle,
        stream: &mut TcpStream,
    ) -> Result<ReceiveReport> {
        let size = self.storage_info.size;
        handle.allocate(size).await?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(handle.file_path())
            .await?;
        let mut file = BufWriter::with_capacity(self.buffer_size, file);

        let receiver = Receiver::with_progress(
            ReceiverConfig {
                expected_size: size,
                buffer_size: self.buffer_size,
                checksum: self.checksum,
            },
            Arc::clone(&self.progress),
        );
        let report = receiver.receive(stream, &mut file).await?;

        file.flush().await?;
        if let Err(e) = file.get_ref().sync_all().await {
            warn!(file_id = %self.file_id, "Failed to synchronize file with storage device: {}", e);
        }
        drop(file);

        if self.simulate_io_failure {
            return Err(io::Error::other("Transfer failed (simulate)").into());
        }
        if let Some(checksum) = &report.checksum {
            handle.set_checksum(checksum.clone());
        }
        Ok(report)
    }
}

fn interrupted() -> TransferError {
    TransferError::Cancelled("transfer interrupted".to_string())
}
