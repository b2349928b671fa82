//! Pool-to-pool client: owns the transfers this pool pulls from others.

pub mod admin;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::checksum::Checksum;
use crate::companion::{self, CompanionHandle, CompanionSettings, CompanionState, TransferRequest};
use crate::config::{P2pConfig, MAX_TIMEOUT_MS};
use crate::error::{AcceptorError, TransferError};
use crate::services::{PoolMessage, Services};
use crate::transport::Acceptor;
use crate::types::{FileId, SessionId};

type SessionMap = Arc<Mutex<BTreeMap<SessionId, Arc<CompanionHandle>>>>;

/// One line of the session listing.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub file_id: FileId,
    pub source_pool: String,
    pub state: CompanionState,
    pub bytes: u64,
    pub checksum: Option<Checksum>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Beyond the advisory concurrency ceiling
    pub queued: bool,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.id, self.file_id, self.state, self.source_pool, self.bytes
        )?;
        if self.queued {
            f.write_str(" (queued)")?;
        }
        if let Some(error) = &self.error {
            write!(f, " [{error}]")?;
        }
        Ok(())
    }
}

pub struct TransferSessionManager {
    config: Mutex<P2pConfig>,
    acceptor: Arc<Acceptor>,
    services: Services,
    sessions: SessionMap,
    remove_on_exit: Arc<AtomicBool>,
}

impl TransferSessionManager {
    pub fn new(config: P2pConfig, acceptor: Arc<Acceptor>, services: Services) -> Self {
        let remove_on_exit = Arc::new(AtomicBool::new(config.remove_on_exit));
        Self {
            config: Mutex::new(config),
            acceptor,
            services,
            sessions: Arc::new(Mutex::new(BTreeMap::new())),
            remove_on_exit,
        }
    }

    /// Start pulling a replica. Returns as soon as the transfer is
    /// registered; `on_complete` runs once it is done.
    pub async fn start<F>(&self, request: TransferRequest, on_complete: F) -> Result<SessionId, AcceptorError>
    where
        F: FnOnce(FileId, Option<TransferError>) + Send + 'static,
    {
        let settings = CompanionSettings::from_config(&self.config());
        let (handle, launch) = companion::register(
            request,
            settings,
            self.services.clone(),
            Arc::clone(&self.acceptor),
        )
        .await?;
        let id = handle.id();

        lock(&self.sessions).insert(id, handle);

        let sessions = Arc::clone(&self.sessions);
        let remove_on_exit = Arc::clone(&self.remove_on_exit);
        launch.launch(Box::new(move |file_id, error| {
            if remove_on_exit.load(Ordering::Relaxed) {
                lock(&sessions).remove(&id);
            }
            on_complete(file_id, error);
        }));

        Ok(id)
    }

    /// Request cancellation without waiting for it. False if the session is
    /// unknown, done, or already cancelled.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.session(id) {
            Some(handle) => handle.cancel("Transfer cancelled"),
            None => false,
        }
    }

    /// Route a notification from a source pool to its transfer.
    pub fn message_arrived(&self, message: PoolMessage) {
        let id = message.session();
        match self.session(id) {
            Some(handle) => {
                if !handle.deliver(message) {
                    warn!(session = %id, "message for finished transfer dropped");
                }
            }
            None => warn!(session = %id, "message for unknown session"),
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let max_active = self.max_active();
        let mut live = 0usize;
        lock(&self.sessions)
            .values()
            .map(|handle| {
                let status = handle.status();
                let queued = if status.state.is_terminal() {
                    false
                } else {
                    live += 1;
                    live > max_active
                };
                SessionSummary {
                    id: handle.id(),
                    file_id: handle.file_id().clone(),
                    source_pool: handle.source_pool().to_string(),
                    state: status.state,
                    bytes: handle.bytes_received(),
                    checksum: status.checksum,
                    error: status.error,
                    created_at: handle.created_at(),
                    queued,
                }
            })
            .collect()
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<CompanionHandle>> {
        lock(&self.sessions).get(&id).cloned()
    }

    /// Drop a listing entry. The transfer itself is not cancelled.
    pub fn remove(&self, id: SessionId) -> bool {
        lock(&self.sessions).remove(&id).is_some()
    }

    fn live_sessions(&self) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|h| !h.state().is_terminal())
            .count()
    }

    pub fn active_jobs(&self) -> usize {
        self.live_sessions().min(self.max_active())
    }

    pub fn queued_jobs(&self) -> usize {
        self.live_sessions().saturating_sub(self.max_active())
    }

    pub fn max_active(&self) -> usize {
        self.config().max_active
    }

    pub fn set_max_active(&self, max_active: usize) {
        self.config().max_active = max_active;
    }

    pub fn namespace_timeout(&self) -> Duration {
        self.config().namespace_timeout()
    }

    /// Clamped to `1..=MAX_TIMEOUT_MS` milliseconds.
    pub fn set_namespace_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.config().namespace_timeout_ms = millis.clamp(1, MAX_TIMEOUT_MS);
    }

    pub fn remove_on_exit(&self) -> bool {
        self.remove_on_exit.load(Ordering::Relaxed)
    }

    pub fn set_remove_on_exit(&self, remove: bool) {
        self.remove_on_exit.store(remove, Ordering::Relaxed);
        self.config().remove_on_exit = remove;
    }

    pub fn set_simulate_io_failure(&self, fail: bool) {
        self.config().simulate_io_failure = fail;
    }

    pub fn simulate_io_failure(&self) -> bool {
        self.config().simulate_io_failure
    }

    pub async fn set_port(&self, port: u16) -> Result<(), AcceptorError> {
        self.acceptor.set_port(port).await
    }

    pub async fn info(&self) -> String {
        let listener = self.acceptor.status().await;
        format!(
            " Pool to Pool (P2P)\n  Listener   : {}\n  Max Active : {}\n  Active     : {}\n  Queued     : {}\nPnfs Timeout : {} seconds\n",
            listener,
            self.max_active(),
            self.active_jobs(),
            self.queued_jobs(),
            self.namespace_timeout().as_secs()
        )
    }

    pub async fn print_setup(&self) -> String {
        format!(
            "#\n#  Pool to Pool (P2P)\n#\npp set port {}\npp set max active {}\npp set pnfs timeout {}\n",
            self.acceptor.recommended_port().await,
            self.max_active(),
            self.namespace_timeout().as_secs()
        )
    }

    /// Cancel every transfer still running.
    pub fn shutdown(&self) {
        let handles: Vec<_> = lock(&self.sessions).values().cloned().collect();
        let cancelled = handles
            .iter()
            .filter(|h| h.cancel("Pool is shutting down"))
            .count();
        info!(cancelled, "pool to pool client shut down");
    }

    fn config(&self) -> MutexGuard<'_, P2pConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock(
    sessions: &Mutex<BTreeMap<SessionId, Arc<CompanionHandle>>>,
) -> MutexGuard<'_, BTreeMap<SessionId, Arc<CompanionHandle>>> {
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}
