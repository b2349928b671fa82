//! Companion actor: the transfer state machine.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::copy::CopyJob;
use super::state::CompanionState;
use super::{CompanionSettings, CompanionStatus, CompletionCallback, Event, TransferRequest};
use crate::checksum::Checksum;
use crate::error::{CoordinationError, ProtocolError, TransferError};
use crate::services::{PushRequest, Services};
use crate::streaming::ReceiveReport;
use crate::transport::Acceptor;
use crate::types::{MoverId, SessionId, StorageInfo};

struct CopyTask {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct Companion {
    id: SessionId,
    request: TransferRequest,
    storage_info: Option<StorageInfo>,
    settings: CompanionSettings,
    services: Services,
    acceptor: Arc<Acceptor>,
    callback: SocketAddr,

    state: CompanionState,
    error: Option<TransferError>,
    mover: Option<MoverId>,
    checksum: Option<Checksum>,
    source_finished: bool,
    ping_failures: u32,
    /// A push request to the source pool has not been answered yet
    push_pending: bool,
    cancel_cause: Option<String>,
    copy: Option<CopyTask>,
    timer: Option<JoinHandle<()>>,

    events: mpsc::UnboundedSender<Event>,
    status: watch::Sender<CompanionStatus>,
    progress: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    on_complete: Option<CompletionCallback>,
}

impl Companion {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        request: TransferRequest,
        settings: CompanionSettings,
        services: Services,
        acceptor: Arc<Acceptor>,
        callback: SocketAddr,
        events: mpsc::UnboundedSender<Event>,
        status: watch::Sender<CompanionStatus>,
        progress: Arc<AtomicU64>,
    ) -> Self {
        Self {
            id,
            storage_info: request.storage_info.clone(),
            request,
            settings,
            services,
            acceptor,
            callback,
            state: CompanionState::New,
            error: None,
            mover: None,
            checksum: None,
            source_finished: false,
            ping_failures: 0,
            push_pending: false,
            cancel_cause: None,
            copy: None,
            timer: None,
            events,
            status,
            progress,
            finished: Arc::new(AtomicBool::new(false)),
            on_complete: None,
        }
    }

    pub(crate) fn with_finished_flag(mut self, finished: Arc<AtomicBool>) -> Self {
        self.finished = finished;
        self
    }

    pub(crate) fn with_callback(mut self, on_complete: CompletionCallback) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    pub(crate) async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Event>) {
        info!(
            session = %self.id,
            file_id = %self.request.file_id,
            pool = %self.request.source_pool,
            "starting pool to pool transfer"
        );
        self.start();

        while !self.state.is_terminal() {
            self.publish();
            // The actor keeps a sender itself, so the mailbox never closes
            let Some(event) = mailbox.recv().await else {
                break;
            };
            self.handle(event);
        }

        self.finish().await;
    }

    // =========================================================================
    // Event dispatch
    // =========================================================================

    fn handle(&mut self, event: Event) {
        match event {
            Event::StorageInfo(result) => self.on_storage_info(result),
            Event::MoverStarted(result) => self.on_mover_started(result),
            Event::Connected(stream, peer) => self.on_connected(stream, peer),
            Event::CopyFinished(result) => self.on_copy_finished(result),
            Event::SourceFinished(result) => self.on_source_finished(result),
            Event::KeepaliveTick => self.on_keepalive_tick(),
            Event::PingReply(result) => self.on_ping_reply(result),
            Event::Cancel(cause) => self.on_cancel(cause),
        }
    }

    fn start(&mut self) {
        if self.storage_info.is_some() {
            self.request_source_mover();
            return;
        }

        self.transition(CompanionState::FetchingStorageInfo);
        let namespace = Arc::clone(&self.services.namespace);
        let file_id = self.request.file_id.clone();
        self.send_request(self.settings.namespace_timeout, Event::StorageInfo, async move {
            namespace.storage_info(&file_id).await
        });
    }

    fn on_storage_info(&mut self, result: Result<StorageInfo, CoordinationError>) {
        if self.state != CompanionState::FetchingStorageInfo {
            debug!(session = %self.id, state = %self.state, "ignoring late storage info");
            return;
        }
        match result {
            Ok(info) => {
                self.storage_info = Some(info);
                self.request_source_mover();
            }
            Err(e) => self.fail(TransferError::coordination("storage info lookup", e)),
        }
    }

    fn request_source_mover(&mut self) {
        let Some(storage_info) = self.storage_info.clone() else {
            self.fail(TransferError::Internal(
                "requesting a mover without storage info".to_string(),
            ));
            return;
        };

        self.transition(CompanionState::RequestingSourceMover);
        let request = PushRequest {
            source_pool: self.request.source_pool.clone(),
            file_id: self.request.file_id.clone(),
            storage_info,
            callback: self.callback,
            session: self.id,
            initiator: format!("pool:{}", self.settings.pool_name),
        };
        debug!(session = %self.id, callback = %self.callback, "requesting source mover");

        let pool = Arc::clone(&self.services.pool);
        self.push_pending = true;
        self.send_request(self.settings.pool_timeout, Event::MoverStarted, async move {
            pool.request_push(request).await
        });
    }

    fn on_mover_started(&mut self, result: Result<MoverId, CoordinationError>) {
        self.push_pending = false;
        match (self.state, result) {
            (CompanionState::RequestingSourceMover, Ok(mover)) => {
                debug!(session = %self.id, %mover, "source mover started");
                self.mover = Some(mover);
                self.transition(CompanionState::WaitingForConnection);
                self.start_timer();
            }
            // The source connected before its reply reached us
            (CompanionState::Transferring | CompanionState::AwaitingSourceCompletion, Ok(mover)) => {
                self.mover = Some(mover);
            }
            // Cancelled before the source answered; the mover it started
            // still has to be stopped
            (CompanionState::Cancelled, Ok(mover)) => {
                self.mover = Some(mover);
                if let Some(cause) = self.cancel_cause.clone() {
                    self.cancel_source_mover(mover, cause);
                }
                self.settle();
            }
            (CompanionState::Cancelled | CompanionState::Failed, result) => {
                debug!(session = %self.id, ?result, "mover reply while unwinding");
                self.settle();
            }
            (
                CompanionState::RequestingSourceMover
                | CompanionState::Transferring
                | CompanionState::AwaitingSourceCompletion,
                Err(e),
            ) => {
                self.fail(TransferError::coordination("mover request", e));
            }
            (state, result) => {
                debug!(session = %self.id, %state, ?result, "ignoring mover reply");
            }
        }
    }

    fn on_connected(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.state.accepts_connection() {
            warn!(session = %self.id, %peer, state = %self.state, "unexpected connection, closing");
            return;
        }
        let Some(storage_info) = self.storage_info.clone() else {
            self.fail(TransferError::Internal(
                "connection without storage info".to_string(),
            ));
            return;
        };

        debug!(session = %self.id, %peer, "source connected");
        self.stop_timer();
        self.transition(CompanionState::Transferring);

        let job = CopyJob {
            file_id: self.request.file_id.clone(),
            storage_info,
            target_state: self.request.target_state,
            sticky: self.request.sticky.clone(),
            repository: Arc::clone(&self.services.repository),
            checksum: self.settings.checksum,
            buffer_size: self.settings.buffer_size,
            simulate_io_failure: self.settings.simulate_io_failure,
            progress: Arc::clone(&self.progress),
        };
        let token = CancellationToken::new();
        let events = self.events.clone();
        let task = tokio::spawn({
            let token = token.clone();
            async move {
                let result = job.run(stream, token).await;
                let _ = events.send(Event::CopyFinished(result));
            }
        });
        self.copy = Some(CopyTask { token, task });
    }

    fn on_copy_finished(&mut self, result: Result<ReceiveReport, TransferError>) {
        self.copy = None;

        match self.state {
            CompanionState::Transferring => match result {
                Ok(report) => {
                    info!(
                        session = %self.id,
                        file_id = %self.request.file_id,
                        bytes = report.bytes,
                        "replica received"
                    );
                    self.checksum = report.checksum;
                    if self.source_finished {
                        self.transition(CompanionState::Done);
                    } else {
                        self.transition(CompanionState::AwaitingSourceCompletion);
                        self.start_timer();
                    }
                }
                Err(e) => self.fail(e),
            },
            CompanionState::Cancelled | CompanionState::Failed => {
                match result {
                    Ok(_) => warn!(session = %self.id, "copy completed after {}", self.state),
                    Err(e) => debug!(session = %self.id, "copy unwound: {}", e),
                }
                self.settle();
            }
            state => {
                self.fail(TransferError::Internal(format!(
                    "copy finished in state {state}"
                )));
            }
        }
    }

    fn on_source_finished(&mut self, result: Result<(), CoordinationError>) {
        match (self.state, result) {
            (CompanionState::AwaitingSourceCompletion, Ok(())) => {
                self.transition(CompanionState::Done);
            }
            (CompanionState::Transferring, Ok(())) => {
                self.source_finished = true;
            }
            (CompanionState::Cancelled | CompanionState::Failed, result) => {
                debug!(session = %self.id, ?result, "source finished while unwinding");
            }
            (_, Err(e)) => self.fail(TransferError::coordination("source mover", e)),
            (_, Ok(())) => self.fail(ProtocolError::FinishedBeforeConnect.into()),
        }
    }

    // =========================================================================
    // Keepalive
    // =========================================================================

    fn start_timer(&mut self) {
        self.stop_timer();
        let events = self.events.clone();
        let period = self.settings.ping_period;
        let Some(first) = Instant::now().checked_add(period) else {
            warn!(session = %self.id, ?period, "ping period out of range, keepalive disabled");
            return;
        };
        self.timer = Some(tokio::spawn(async move {
            let mut ticks = interval_at(first, period);
            loop {
                ticks.tick().await;
                if events.send(Event::KeepaliveTick).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn on_keepalive_tick(&mut self) {
        if !self.state.needs_keepalive() {
            return;
        }
        let Some(mover) = self.mover else {
            return;
        };
        let pool = Arc::clone(&self.services.pool);
        let source = self.request.source_pool.clone();
        self.send_request(self.settings.pool_timeout, Event::PingReply, async move {
            pool.ping_mover(&source, mover).await
        });
    }

    fn on_ping_reply(&mut self, result: Result<(), CoordinationError>) {
        if !self.state.needs_keepalive() {
            return;
        }
        match result {
            Ok(()) => self.ping_failures = 0,
            Err(e @ (CoordinationError::NoRoute(_) | CoordinationError::Timeout)) => {
                self.fail(TransferError::coordination("mover ping", e));
            }
            Err(e) => {
                self.ping_failures += 1;
                if self.ping_failures >= self.settings.max_ping_failures {
                    self.fail(TransferError::coordination("mover ping", e));
                } else {
                    warn!(
                        session = %self.id,
                        failures = self.ping_failures,
                        "mover ping failed: {}",
                        e
                    );
                }
            }
        }
    }

    // =========================================================================
    // Cancellation and failure
    // =========================================================================

    fn on_cancel(&mut self, cause: String) {
        if self.state.is_terminal() || self.state.is_unwinding() {
            return;
        }
        info!(session = %self.id, file_id = %self.request.file_id, "cancelling transfer: {}", cause);
        self.stop_timer();

        if let Some(mover) = self.mover {
            self.cancel_source_mover(mover, cause.clone());
        }
        self.cancel_cause = Some(cause.clone());

        self.record_error(TransferError::Cancelled(cause));
        self.unwind(CompanionState::Cancelled);
    }

    /// Best effort; the source also gives up once the connection drops.
    fn cancel_source_mover(&self, mover: MoverId, cause: String) {
        let pool = Arc::clone(&self.services.pool);
        let source = self.request.source_pool.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.cancel_push(&source, mover, &cause).await {
                debug!(%mover, "cancel request to source failed: {}", e);
            }
        });
    }

    fn fail(&mut self, error: TransferError) {
        if self.state.is_terminal() {
            return;
        }
        self.record_error(error);
        self.stop_timer();
        if !self.state.is_unwinding() {
            self.unwind(CompanionState::Failed);
        }
    }

    /// Interrupt an active copy and wait in `state` for whatever is still
    /// outstanding, or finish now.
    fn unwind(&mut self, state: CompanionState) {
        if let Some(copy) = &self.copy {
            copy.token.cancel();
        }
        if self.outstanding(state) {
            self.transition(state);
        } else {
            self.transition(CompanionState::Done);
        }
    }

    fn outstanding(&self, state: CompanionState) -> bool {
        self.copy.is_some() || (state == CompanionState::Cancelled && self.push_pending)
    }

    fn settle(&mut self) {
        if !self.outstanding(self.state) {
            self.transition(CompanionState::Done);
        }
    }

    fn record_error(&mut self, error: TransferError) {
        if self.error.is_some() {
            debug!(session = %self.id, "ignoring subsequent error: {}", error);
            return;
        }
        if error.is_bug() {
            error!(session = %self.id, "bug detected: {}", error);
        } else if !error.is_cancelled() {
            error!(
                session = %self.id,
                file_id = %self.request.file_id,
                pool = %self.request.source_pool,
                "transfer failed: {}",
                error
            );
        }
        self.error = Some(error);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn transition(&mut self, next: CompanionState) {
        if !self.state.can_transition_to(next) {
            error!(session = %self.id, "bug detected: illegal transition {} -> {}", self.state, next);
        }
        debug!(session = %self.id, "{} -> {}", self.state, next);
        if next.is_terminal() {
            self.finished.store(true, Ordering::SeqCst);
        }
        self.state = next;
    }

    /// Run a collaborator request on its own task and post the reply.
    fn send_request<T, F>(
        &self,
        timeout: Duration,
        event: fn(Result<T, CoordinationError>) -> Event,
        request: F,
    ) where
        T: Send + 'static,
        F: Future<Output = Result<T, CoordinationError>> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let reply = tokio::time::timeout(timeout, request)
                .await
                .unwrap_or(Err(CoordinationError::Timeout));
            let _ = events.send(event(reply));
        });
    }

    fn snapshot(&self) -> CompanionStatus {
        CompanionStatus {
            state: self.state,
            mover: self.mover,
            checksum: self.checksum.clone(),
            error: self.error.as_ref().map(ToString::to_string),
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.snapshot());
    }

    async fn finish(mut self) {
        self.stop_timer();
        if let Some(copy) = self.copy.take() {
            copy.token.cancel();
            copy.task.abort();
        }
        self.acceptor.unregister(self.id).await;

        match &self.error {
            None => info!(
                session = %self.id,
                file_id = %self.request.file_id,
                "pool to pool transfer completed"
            ),
            Some(e) => debug!(session = %self.id, "pool to pool transfer ended: {}", e),
        }

        self.publish();
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(self.request.file_id.clone(), self.error.take());
        }
    }
}
