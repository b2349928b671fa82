//! Fake collaborators shared by the integration tests: a namespace, a source
//! pool whose movers speak DCap over real sockets, and a repository backed by
//! a temporary directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use poolp2p::checksum::Checksum;
use poolp2p::companion::{CompanionHandle, CompanionState, TransferRequest};
use poolp2p::error::{CoordinationError, RepositoryError};
use poolp2p::repository::{ReplicaSpec, Repository, WriteHandle};
use poolp2p::services::{NamespaceService, PoolMessage, PoolStub, PushRequest, Services};
use poolp2p::streaming::protocol::{
    encode_data_block, encode_data_header, encode_data_trailer, encode_preamble, read_frame, Ack,
    MessageType, Request,
};
use poolp2p::{Acceptor, FileId, MoverId, P2pConfig, SessionId, StorageInfo, TransferError, TransferSessionManager};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Error code the fake source reports for failed movers
pub const MOVER_FAILED: i32 = 204;

// =============================================================================
// Namespace
// =============================================================================

#[derive(Default)]
pub struct FakeNamespace {
    files: Mutex<HashMap<FileId, StorageInfo>>,
    delay: Mutex<Option<Duration>>,
    pub lookups: AtomicUsize,
}

impl FakeNamespace {
    pub fn add(&self, file_id: FileId, info: StorageInfo) {
        self.files.lock().unwrap().insert(file_id, info);
    }

    /// Answer lookups only after `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl NamespaceService for FakeNamespace {
    async fn storage_info(&self, file_id: &FileId) -> Result<StorageInfo, CoordinationError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(|| CoordinationError::failure(10001, format!("No such file: {file_id}")))
    }
}

// =============================================================================
// Source pool
// =============================================================================

/// How the fake source pool behaves for a file.
#[derive(Debug, Clone)]
pub enum MoverScript {
    Normal,
    /// Report this size in the LOCATE reply
    WrongSize(u64),
    /// Send only this many bytes of data
    Truncate(usize),
    /// Answer READ with an error
    ReadError(i32, String),
    /// Connect, then never answer
    Stall,
    /// Start a mover that never connects
    NeverConnect,
    /// Refuse to start a mover
    Refuse,
    /// Serve the data, then report the mover as failed
    FailNotice(String),
    /// Serve the data without a finish notice, then fail the push request
    LateRefusal(String),
}

pub struct FakePool {
    files: Mutex<HashMap<FileId, Vec<u8>>>,
    scripts: Mutex<HashMap<FileId, MoverScript>>,
    pub requests: Mutex<Vec<PushRequest>>,
    pub cancels: Mutex<Vec<(String, MoverId, String)>>,
    pub pings: AtomicUsize,
    ping_result: Mutex<Result<(), CoordinationError>>,
    push_delay: Mutex<Option<Duration>>,
    next_mover: AtomicU32,
    notify: mpsc::UnboundedSender<PoolMessage>,
}

impl FakePool {
    fn new(notify: mpsc::UnboundedSender<PoolMessage>) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
            ping_result: Mutex::new(Ok(())),
            push_delay: Mutex::new(None),
            next_mover: AtomicU32::new(1),
            notify,
        }
    }

    pub fn add_file(&self, file_id: FileId, data: Vec<u8>) {
        self.files.lock().unwrap().insert(file_id, data);
    }

    pub fn script(&self, file_id: &FileId, script: MoverScript) {
        self.scripts.lock().unwrap().insert(file_id.clone(), script);
    }

    pub fn set_ping_result(&self, result: Result<(), CoordinationError>) {
        *self.ping_result.lock().unwrap() = result;
    }

    /// Start movers right away but answer push requests only after `delay`.
    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock().unwrap() = Some(delay);
    }

    pub fn movers_started(&self) -> u32 {
        self.next_mover.load(Ordering::SeqCst) - 1
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PoolStub for FakePool {
    async fn request_push(&self, request: PushRequest) -> Result<MoverId, CoordinationError> {
        self.requests.lock().unwrap().push(request.clone());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.file_id)
            .cloned()
            .unwrap_or(MoverScript::Normal);
        if let MoverScript::Refuse = script {
            return Err(CoordinationError::failure(MOVER_FAILED, "mover queue full"));
        }

        let mover = MoverId(self.next_mover.fetch_add(1, Ordering::SeqCst));
        let delay = *self.push_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let MoverScript::NeverConnect = script {
            return Ok(mover);
        }

        let data = self
            .files
            .lock()
            .unwrap()
            .get(&request.file_id)
            .cloned()
            .unwrap_or_default();
        if let MoverScript::LateRefusal(message) = &script {
            serve_mover(request.callback, request.session, &data, &script)
                .await
                .map_err(|e| CoordinationError::failure(MOVER_FAILED, e.to_string()))?;
            // Let the destination finish its side of the copy first
            tokio::time::sleep(Duration::from_millis(200)).await;
            return Err(CoordinationError::failure(MOVER_FAILED, message.clone()));
        }
        let notify = self.notify.clone();
        tokio::spawn(async move {
            let served = serve_mover(request.callback, request.session, &data, &script).await;
            let result = match (script, served) {
                (MoverScript::FailNotice(message), _) => {
                    Err(CoordinationError::failure(MOVER_FAILED, message))
                }
                (_, Ok(())) => Ok(()),
                (_, Err(e)) => Err(CoordinationError::failure(MOVER_FAILED, e.to_string())),
            };
            let _ = notify.send(PoolMessage::TransferFinished {
                session: request.session,
                result,
            });
        });
        Ok(mover)
    }

    async fn cancel_push(
        &self,
        pool: &str,
        mover: MoverId,
        cause: &str,
    ) -> Result<(), CoordinationError> {
        self.cancels
            .lock()
            .unwrap()
            .push((pool.to_string(), mover, cause.to_string()));
        Ok(())
    }

    async fn ping_mover(&self, _pool: &str, _mover: MoverId) -> Result<(), CoordinationError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.ping_result.lock().unwrap().clone()
    }
}

/// Source side of the DCap conversation.
async fn serve_mover(
    callback: SocketAddr,
    session: SessionId,
    data: &[u8],
    script: &MoverScript,
) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(callback).await?;
    stream.write_all(&encode_preamble(session, b"")).await?;

    if let MoverScript::Stall = script {
        let mut buf = [0u8; 64];
        while stream.read(&mut buf).await? > 0 {}
        anyhow::bail!("destination hung up");
    }

    loop {
        let frame = read_frame(&mut stream).await?;
        match Request::decode(frame)? {
            Request::Locate => {
                let size = match script {
                    MoverScript::WrongSize(size) => *size,
                    _ => data.len() as u64,
                };
                stream.write_all(&Ack::located(size, 0).encode()).await?;
            }
            Request::Read { .. } => {
                if let MoverScript::ReadError(code, message) = script {
                    let ack = Ack::error(MessageType::Ack, MessageType::Read, *code, message);
                    stream.write_all(&ack.encode()).await?;
                    continue;
                }
                let payload = match script {
                    MoverScript::Truncate(n) => &data[..*n],
                    _ => data,
                };
                stream
                    .write_all(&Ack::ok(MessageType::Ack, MessageType::Read).encode())
                    .await?;
                stream.write_all(&encode_data_header()).await?;
                for block in payload.chunks(64 * 1024) {
                    stream.write_all(&encode_data_block(block)).await?;
                }
                stream.write_all(&encode_data_trailer()).await?;
                stream
                    .write_all(&Ack::ok(MessageType::Fin, MessageType::Read).encode())
                    .await?;
            }
            Request::Close => {
                stream
                    .write_all(&Ack::ok(MessageType::Ack, MessageType::Close).encode())
                    .await?;
                stream.flush().await?;
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

#[derive(Default)]
pub struct RepositoryStats {
    pub created: AtomicUsize,
    pub commits: AtomicUsize,
    pub closes: AtomicUsize,
    pub allocated: AtomicU64,
    pub specs: Mutex<Vec<ReplicaSpec>>,
    pub checksums: Mutex<Vec<Checksum>>,
}

pub struct FakeRepository {
    root: PathBuf,
    pub stats: Arc<RepositoryStats>,
}

impl FakeRepository {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            stats: Arc::new(RepositoryStats::default()),
        }
    }

    pub fn path(&self, file_id: &FileId) -> PathBuf {
        self.root.join(file_id.as_str())
    }

    pub fn commits(&self) -> usize {
        self.stats.commits.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn create_replica(
        &self,
        spec: ReplicaSpec,
    ) -> Result<Box<dyn WriteHandle>, RepositoryError> {
        let path = self.path(&spec.file_id);
        if path.exists() {
            return Err(RepositoryError::FileInCache(spec.file_id));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        self.stats.specs.lock().unwrap().push(spec);
        Ok(Box::new(FakeHandle {
            path,
            stats: Arc::clone(&self.stats),
            committed: false,
        }))
    }
}

struct FakeHandle {
    path: PathBuf,
    stats: Arc<RepositoryStats>,
    committed: bool,
}

#[async_trait]
impl WriteHandle for FakeHandle {
    async fn allocate(&mut self, bytes: u64) -> Result<(), RepositoryError> {
        self.stats.allocated.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn file_path(&self) -> &Path {
        &self.path
    }

    fn set_checksum(&mut self, checksum: Checksum) {
        self.stats.checksums.lock().unwrap().push(checksum);
    }

    async fn commit(&mut self) -> Result<(), RepositoryError> {
        self.committed = true;
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        if !self.committed {
            let _ = tokio::fs::remove_file(&self.path).await;
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

pub fn test_config() -> P2pConfig {
    P2pConfig {
        pool_name: "pool_b".to_string(),
        listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        buffer_size: 8 * 1024,
        handshake_timeout_ms: 5_000,
        ..P2pConfig::default()
    }
}

pub struct Harness {
    pub manager: Arc<TransferSessionManager>,
    pub acceptor: Arc<Acceptor>,
    pub namespace: Arc<FakeNamespace>,
    pub pool: Arc<FakePool>,
    pub repository: Arc<FakeRepository>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: P2pConfig) -> Self {
        poolp2p::logging::init();

        let dir = TempDir::new().unwrap();
        let (notify, mut notifications) = mpsc::unbounded_channel();

        let acceptor = Arc::new(Acceptor::new(&config));
        let namespace = Arc::new(FakeNamespace::default());
        let pool = Arc::new(FakePool::new(notify));
        let repository = Arc::new(FakeRepository::new(dir.path()));

        let services = Services {
            namespace: namespace.clone(),
            pool: pool.clone(),
            repository: repository.clone(),
        };
        let manager = Arc::new(TransferSessionManager::new(
            config,
            Arc::clone(&acceptor),
            services,
        ));

        // Deliver source pool notifications like the message layer would
        let forward = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Some(message) = notifications.recv().await {
                forward.message_arrived(message);
            }
        });

        Self {
            manager,
            acceptor,
            namespace,
            pool,
            repository,
            _dir: dir,
        }
    }

    /// Make a file known to the namespace and the source pool.
    pub fn add_file(&self, name: &str, data: Vec<u8>) -> FileId {
        let file_id = FileId::new(name);
        self.namespace.add(
            file_id.clone(),
            StorageInfo::new(data.len() as u64, "test:disk"),
        );
        self.pool.add_file(file_id.clone(), data);
        file_id
    }

    pub async fn start(
        &self,
        request: TransferRequest,
    ) -> (SessionId, oneshot::Receiver<Option<TransferError>>) {
        let (tx, rx) = oneshot::channel();
        let id = self
            .manager
            .start(request, move |_, error| {
                let _ = tx.send(error);
            })
            .await
            .unwrap();
        (id, rx)
    }

    /// Start a transfer and wait for its outcome.
    pub async fn transfer(&self, request: TransferRequest) -> Option<TransferError> {
        let (_, done) = self.start(request).await;
        tokio::time::timeout(Duration::from_secs(20), done)
            .await
            .expect("transfer did not finish")
            .expect("completion callback dropped")
    }
}

pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Poll until the companion reaches `state`.
pub async fn wait_for_state(handle: &CompanionHandle, state: CompanionState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while handle.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("companion never reached {state}, stuck in {}", handle.state()));
}
