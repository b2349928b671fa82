//! Shared listener for inbound pool-to-pool connections.
//!
//! One listening socket serves every transfer of the pool. Source movers
//! connect back and announce the session id they were given; the acceptor
//! hands the socket to whichever sink registered that id. The socket only
//! exists while at least one session is registered.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::P2pConfig;
use crate::error::AcceptorError;
use crate::streaming::protocol as dcap;
use crate::types::SessionId;

/// First id handed out after startup
const FIRST_SESSION_ID: u32 = 100;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receiver of the connection belonging to a registered session.
pub trait ConnectionSink: Send + Sync {
    /// Take ownership of an authenticated connection. Must not block.
    fn transfer(&self, stream: TcpStream, peer: SocketAddr);
}

type SessionMap = Arc<Mutex<HashMap<SessionId, Arc<dyn ConnectionSink>>>>;

struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct Lifecycle {
    listener: Option<Listener>,
    next_id: u32,
    recommended_port: u16,
    last_error: Option<String>,
}

pub struct Acceptor {
    lifecycle: AsyncMutex<Lifecycle>,
    sessions: SessionMap,
    listen_address: IpAddr,
    handshake_timeout: Duration,
}

impl Acceptor {
    pub fn new(config: &P2pConfig) -> Self {
        Self {
            lifecycle: AsyncMutex::new(Lifecycle {
                listener: None,
                next_id: FIRST_SESSION_ID,
                recommended_port: config.port,
                last_error: None,
            }),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            listen_address: config.listen_address,
            handshake_timeout: config.handshake_timeout(),
        }
    }

    /// Register a sink and return its session id, starting the listener if
    /// this is the first session.
    pub async fn register(&self, sink: Arc<dyn ConnectionSink>) -> Result<SessionId, AcceptorError> {
        let mut lifecycle = self.lifecycle.lock().await;

        if lifecycle.listener.is_none() {
            match self.start(lifecycle.recommended_port).await {
                Ok(listener) => {
                    info!(address = %listener.local_addr, "P2P listener started");
                    lifecycle.last_error = None;
                    lifecycle.listener = Some(listener);
                }
                Err(e) => {
                    error!("{}", e);
                    lifecycle.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        }

        let mut sessions = self.lock_sessions();
        let mut id = SessionId(lifecycle.next_id);
        while sessions.contains_key(&id) {
            id = SessionId(id.0.wrapping_add(1));
        }
        lifecycle.next_id = id.0.wrapping_add(1);
        sessions.insert(id, sink);
        debug!(session = %id, "registered");
        Ok(id)
    }

    /// Remove a session. The listener is stopped, and its port released,
    /// before this returns if no sessions remain.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;

        let (removed, empty) = {
            let mut sessions = self.lock_sessions();
            let removed = sessions.remove(&id).is_some();
            (removed, sessions.is_empty())
        };
        if removed {
            debug!(session = %id, "unregistered");
        }

        if empty {
            if let Some(listener) = lifecycle.listener.take() {
                listener.shutdown.cancel();
                if let Err(e) = listener.task.await {
                    error!("P2P accept loop terminated abnormally: {}", e);
                }
                info!(address = %listener.local_addr, "P2P listener stopped");
            }
        }
        removed
    }

    /// Address the listener is bound to.
    pub async fn bound_address(&self) -> Result<SocketAddr, AcceptorError> {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle
            .listener
            .as_ref()
            .map(|l| l.local_addr)
            .ok_or(AcceptorError::NotRunning)
    }

    /// Change the port used the next time the listener starts.
    pub async fn set_port(&self, port: u16) -> Result<(), AcceptorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.listener.is_some() {
            return Err(AcceptorError::PortLocked);
        }
        lifecycle.recommended_port = port;
        Ok(())
    }

    pub async fn recommended_port(&self) -> u16 {
        self.lifecycle.lock().await.recommended_port
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub async fn status(&self) -> String {
        let lifecycle = self.lifecycle.lock().await;
        let current = match (&lifecycle.listener, &lifecycle.last_error) {
            (Some(listener), _) => listener.local_addr.port().to_string(),
            (None, Some(e)) => format!("Error : {e}"),
            (None, None) => "Inactive".to_string(),
        };
        format!(
            "Listen port (recommended={}) {}",
            lifecycle.recommended_port, current
        )
    }

    async fn start(&self, port: u16) -> Result<Listener, AcceptorError> {
        let addr = SocketAddr::new(self.listen_address, port);
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| AcceptorError::Bind { addr, source })?;
        let local_addr = tcp
            .local_addr()
            .map_err(|source| AcceptorError::Bind { addr, source })?;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            tcp,
            Arc::clone(&self.sessions),
            shutdown.clone(),
            self.handshake_timeout,
        ));

        Ok(Listener {
            local_addr,
            shutdown,
            task,
        })
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<dyn ConnectionSink>>> {
        lock(&self.sessions)
    }
}

fn lock(
    sessions: &SessionMap,
) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<dyn ConnectionSink>>> {
    // The map is only mutated in short critical sections that cannot panic
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}

async fn accept_loop(
    listener: TcpListener,
    sessions: SessionMap,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                    warn!(%peer, "failed to enable TCP keepalive: {}", e);
                }
                let sessions = Arc::clone(&sessions);
                tokio::spawn(async move {
                    handle_connection(stream, peer, sessions, handshake_timeout).await;
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    debug!("P2P accept loop finished");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    sessions: SessionMap,
    handshake_timeout: Duration,
) {
    let id = match tokio::time::timeout(handshake_timeout, dcap::read_session_id(&mut stream)).await
    {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            warn!(%peer, "failed to read session id: {}", e);
            return;
        }
        Err(_) => {
            warn!(%peer, "no session id received within {:?}", handshake_timeout);
            return;
        }
    };

    let sink = lock(&sessions).get(&id).cloned();
    match sink {
        Some(sink) => {
            debug!(session = %id, %peer, "connection accepted");
            sink.transfer(stream, peer);
        }
        None => warn!(session = %id, "Unsolicited connection from {}", peer),
    }
}

/// Address a source pool should connect back to.
///
/// A listener bound to a wildcard address is advertised through `interface`
/// if configured, otherwise through the address of the default route.
pub fn callback_address(bound: SocketAddr, interface: Option<IpAddr>) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let ip = interface
        .or_else(default_route_address)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, bound.port())
}

/// Local address of the default route. Connecting a UDP socket sends nothing.
fn default_route_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
