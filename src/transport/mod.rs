//! Network plumbing shared by all transfers of a pool.

pub mod acceptor;

pub use acceptor::{callback_address, Acceptor, ConnectionSink};
