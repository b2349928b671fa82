//! Pool-to-pool replica replication.
//!
//! A destination pool pulls a replica of a file from a source pool: it asks
//! the source to start a mover, accepts the mover's connection on a shared
//! listener and streams the file over the DCap mover protocol into the local
//! repository.
//!
//! ```text
//! TransferSessionManager ── start ──> Companion (actor, one per transfer)
//!        │                               │  register / unregister
//!        │                               v
//!        │                            Acceptor <── TCP ── source mover
//!        └── pp admin commands           │ dispatch by session id
//!                                        v
//!                                     Receiver (LOCATE / READ / CLOSE)
//! ```

pub mod checksum;
pub mod client;
pub mod companion;
pub mod config;
pub mod error;
pub mod logging;
pub mod repository;
pub mod services;
pub mod streaming;
pub mod transport;
pub mod types;

pub use client::{SessionSummary, TransferSessionManager};
pub use companion::{CompanionHandle, CompanionState, TransferRequest};
pub use config::P2pConfig;
pub use error::{Result, TransferError};
pub use transport::Acceptor;
pub use types::{FileId, MoverId, SessionId, StorageInfo};
