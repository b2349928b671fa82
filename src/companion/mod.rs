//! One companion per in-flight pool-to-pool transfer.
//!
//! A companion is an actor: all events concerning a transfer (replies from
//! the namespace and the source pool, the inbound connection, the end of the
//! bulk copy, timer ticks and cancellation) are queued on its mailbox and
//! handled one at a time by [`actor::Companion`]. The rest of the pool only
//! ever holds a [`CompanionHandle`].

mod actor;
mod copy;
pub mod state;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::checksum::{Checksum, ChecksumType};
use crate::config::P2pConfig;
use crate::error::{AcceptorError, CoordinationError, TransferError};
use crate::repository::{ReplicaState, StickyRecord};
use crate::services::{PoolMessage, Services};
use crate::streaming::ReceiveReport;
use crate::transport::{callback_address, Acceptor, ConnectionSink};
use crate::types::{FileId, MoverId, SessionId, StorageInfo};

pub use state::CompanionState;

use actor::Companion;

/// Invoked exactly once when a transfer reaches `Done`.
pub type CompletionCallback = Box<dyn FnOnce(FileId, Option<TransferError>) + Send>;

/// What to replicate and how the new replica should look.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub file_id: FileId,
    pub source_pool: String,
    /// Looked up in the namespace when absent
    pub storage_info: Option<StorageInfo>,
    pub target_state: ReplicaState,
    pub sticky: Vec<StickyRecord>,
}

impl TransferRequest {
    pub fn new(file_id: FileId, source_pool: impl Into<String>) -> Self {
        Self {
            file_id,
            source_pool: source_pool.into(),
            storage_info: None,
            target_state: ReplicaState::Cached,
            sticky: Vec::new(),
        }
    }

    pub fn with_storage_info(mut self, info: StorageInfo) -> Self {
        self.storage_info = Some(info);
        self
    }

    pub fn with_target_state(mut self, state: ReplicaState) -> Self {
        self.target_state = state;
        self
    }

    pub fn with_sticky(mut self, record: StickyRecord) -> Self {
        self.sticky.push(record);
        self
    }
}

/// Settings captured when a transfer starts.
#[derive(Debug, Clone)]
pub struct CompanionSettings {
    pub pool_name: String,
    pub interface: Option<IpAddr>,
    pub namespace_timeout: Duration,
    pub pool_timeout: Duration,
    pub ping_period: Duration,
    pub max_ping_failures: u32,
    pub checksum: Option<ChecksumType>,
    pub buffer_size: usize,
    pub simulate_io_failure: bool,
}

impl CompanionSettings {
    pub fn from_config(config: &P2pConfig) -> Self {
        Self {
            pool_name: config.pool_name.clone(),
            interface: config.interface,
            namespace_timeout: config.namespace_timeout(),
            pool_timeout: config.pool_timeout(),
            ping_period: config.ping_period(),
            max_ping_failures: config.max_ping_failures,
            checksum: config.transfer_checksum(),
            buffer_size: config.buffer_size,
            simulate_io_failure: config.simulate_io_failure,
        }
    }
}

/// Snapshot of a companion published after every event.
#[derive(Debug, Clone)]
pub struct CompanionStatus {
    pub state: CompanionState,
    pub mover: Option<MoverId>,
    pub checksum: Option<Checksum>,
    /// First recorded failure
    pub error: Option<String>,
}

impl CompanionStatus {
    fn initial() -> Self {
        Self {
            state: CompanionState::New,
            mover: None,
            checksum: None,
            error: None,
        }
    }
}

pub(crate) enum Event {
    StorageInfo(Result<StorageInfo, CoordinationError>),
    MoverStarted(Result<MoverId, CoordinationError>),
    Connected(TcpStream, SocketAddr),
    CopyFinished(Result<ReceiveReport, TransferError>),
    SourceFinished(Result<(), CoordinationError>),
    KeepaliveTick,
    PingReply(Result<(), CoordinationError>),
    Cancel(String),
}

/// Sink registered with the acceptor; forwards the socket to the mailbox.
struct Mailbox(mpsc::UnboundedSender<Event>);

impl ConnectionSink for Mailbox {
    fn transfer(&self, stream: TcpStream, peer: SocketAddr) {
        if self.0.send(Event::Connected(stream, peer)).is_err() {
            debug!(%peer, "companion gone, dropping connection");
        }
    }
}

/// Shared view of a running companion.
pub struct CompanionHandle {
    id: SessionId,
    file_id: FileId,
    source_pool: String,
    created_at: DateTime<Utc>,
    mailbox: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<CompanionStatus>,
    cancel_requested: AtomicBool,
    /// Set by the actor as soon as it stops taking events
    finished: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
}

impl CompanionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn source_pool(&self) -> &str {
        &self.source_pool
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> CompanionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> CompanionState {
        self.status.borrow().state
    }

    pub fn bytes_received(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Request cancellation. Returns false if the transfer already finished
    /// or was cancelled before.
    pub fn cancel(&self, cause: impl Into<String>) -> bool {
        if self.finished.load(Ordering::SeqCst) || self.state().is_terminal() {
            return false;
        }
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.mailbox.send(Event::Cancel(cause.into())).is_ok()
    }

    /// Deliver a notification from the source pool.
    pub fn deliver(&self, message: PoolMessage) -> bool {
        let event = match message {
            PoolMessage::TransferFinished { result, .. } => Event::SourceFinished(result),
        };
        self.mailbox.send(event).is_ok()
    }

    /// Wait until the transfer is done and return its final status.
    pub async fn wait(&self) -> CompanionStatus {
        let mut status = self.status.clone();
        let waited = status
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| s.clone());
        match waited {
            Ok(s) => s,
            Err(_) => status.borrow().clone(),
        }
    }
}

/// A registered companion whose actor has not been started yet.
///
/// Events arriving before [`Launch::launch`] (e.g. an early connection) stay
/// queued on the mailbox.
pub struct Launch {
    companion: Companion,
    mailbox: mpsc::UnboundedReceiver<Event>,
}

impl Launch {
    pub fn launch(self, on_complete: CompletionCallback) {
        tokio::spawn(self.companion.with_callback(on_complete).run(self.mailbox));
    }
}

/// Register a new companion with the acceptor.
pub async fn register(
    request: TransferRequest,
    settings: CompanionSettings,
    services: Services,
    acceptor: Arc<Acceptor>,
) -> Result<(Arc<CompanionHandle>, Launch), AcceptorError> {
    let (tx, rx) = mpsc::unbounded_channel();

    let id = acceptor.register(Arc::new(Mailbox(tx.clone()))).await?;
    let bound = match acceptor.bound_address().await {
        Ok(addr) => addr,
        Err(e) => {
            acceptor.unregister(id).await;
            return Err(e);
        }
    };
    let callback = callback_address(bound, settings.interface);

    let (status_tx, status_rx) = watch::channel(CompanionStatus::initial());
    let progress = Arc::new(AtomicU64::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let handle = Arc::new(CompanionHandle {
        id,
        file_id: request.file_id.clone(),
        source_pool: request.source_pool.clone(),
        created_at: Utc::now(),
        mailbox: tx.clone(),
        status: status_rx,
        cancel_requested: AtomicBool::new(false),
        finished: Arc::clone(&finished),
        progress: Arc::clone(&progress),
    });

    let companion = Companion::new(
        id, request, settings, services, acceptor, callback, tx, status_tx, progress,
    )
    .with_finished_flag(finished);
    Ok((
        handle,
        Launch {
            companion,
            mailbox: rx,
        },
    ))
}
