//! Receiver side of a pool-to-pool transfer.
//!
//! Pulls a whole file from the source mover over an established connection
//! and writes it to the destination, checksumming as it goes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::checksum::{Checksum, ChecksumType, Checksummer};
use crate::error::{ProtocolError, Result};
use crate::streaming::protocol::{
    self as dcap, LocateReply, MessageType, Request, ACK_MIN_LEN, LOCATE_ACK_MIN_LEN,
};

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Size the namespace reports for the file
    pub expected_size: u64,
    /// Block buffer size
    pub buffer_size: usize,
    /// Checksum folded over the data, if verification is on
    pub checksum: Option<ChecksumType>,
}

/// Result of a completed receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    pub bytes: u64,
    pub checksum: Option<Checksum>,
}

/// Receiver state
pub struct Receiver {
    config: ReceiverConfig,
    progress: Arc<AtomicU64>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self::with_progress(config, Arc::new(AtomicU64::new(0)))
    }

    /// Publish the running byte count through `progress`.
    pub fn with_progress(config: ReceiverConfig, progress: Arc<AtomicU64>) -> Self {
        Self { config, progress }
    }

    pub fn bytes_received(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Run the LOCATE / READ / CLOSE exchange and copy the data chain into
    /// `dest`. The connection preamble must already have been consumed up to
    /// the challenge.
    pub async fn receive<S, W>(&self, stream: &mut S, dest: &mut W) -> Result<ReceiveReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        W: AsyncWrite + Unpin,
    {
        let expected = self.config.expected_size;

        dcap::skip_challenge(stream).await?;

        debug!("<gettingFilesize>");
        dcap::write_request(stream, Request::Locate).await?;
        let ack = dcap::read_ack(
            stream,
            MessageType::Ack,
            MessageType::Locate,
            LOCATE_ACK_MIN_LEN,
        )
        .await?;
        let located = LocateReply::decode(&ack)?;
        if located.size != expected {
            return Err(ProtocolError::SizeMismatch {
                expected,
                remote: located.size,
            }
            .into());
        }

        debug!("<StartingIO>");
        dcap::write_request(stream, Request::Read { length: expected }).await?;
        dcap::read_ack(stream, MessageType::Ack, MessageType::Read, ACK_MIN_LEN).await?;
        dcap::read_data_header(stream).await?;

        debug!("<RunningIO>");
        let (total, checksum) = self.copy_data_chain(stream, dest).await?;

        debug!("<WaitingForReadAck>");
        dcap::read_ack(stream, MessageType::Fin, MessageType::Read, ACK_MIN_LEN).await?;

        debug!("<WaitingForCloseAck>");
        dcap::write_request(stream, Request::Close).await?;
        dcap::read_ack(stream, MessageType::Ack, MessageType::Close, ACK_MIN_LEN).await?;

        if total != expected {
            return Err(ProtocolError::TotalMismatch {
                expected,
                received: total,
            }
            .into());
        }

        Ok(ReceiveReport {
            bytes: total,
            checksum,
        })
    }

    async fn copy_data_chain<S, W>(
        &self,
        stream: &mut S,
        dest: &mut W,
    ) -> Result<(u64, Option<Checksum>)>
    where
        S: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let expected = self.config.expected_size;
        let mut hasher = self.config.checksum.map(Checksummer::new);
        let mut buf = vec![0u8; self.config.buffer_size];
        let mut total = 0u64;

        loop {
            let block = stream.read_i32().await?;
            if block < 0 {
                break;
            }

            let mut rest = block as usize;
            if total + rest as u64 > expected {
                return Err(ProtocolError::TotalMismatch {
                    expected,
                    received: total + rest as u64,
                }
                .into());
            }

            // Collect a full buffer before writing it out
            while rest > 0 {
                let n = rest.min(buf.len());
                stream.read_exact(&mut buf[..n]).await?;
                dest.write_all(&buf[..n]).await?;
                if let Some(h) = hasher.as_mut() {
                    h.update(&buf[..n]);
                }
                rest -= n;
                total += n as u64;
                self.progress.store(total, Ordering::Relaxed);
            }
        }

        Ok((total, hasher.map(Checksummer::finish)))
    }
}
