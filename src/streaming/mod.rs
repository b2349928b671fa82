//! Data path of a pool-to-pool transfer.
//!
//! The destination pool plays the client role of the DCap mover protocol:
//!
//! ```text
//! source mover                         destination (Receiver)
//!     | -- session | challenge ---------> |
//!     | <-------------------- LOCATE ----- |
//!     | -- ACK(LOCATE, size) ------------> |
//!     | <-------------------- READ(n) ---- |
//!     | -- ACK(READ) | DATA | blocks... -> |
//!     | -- FIN(READ) --------------------> |
//!     | <-------------------- CLOSE ------ |
//!     | -- ACK(CLOSE) -------------------> |
//! ```

pub mod protocol;
pub mod receiver;

pub use protocol::{read_frame, Ack, Frame, LocateReply, MessageType, Request, MAX_FRAME_SIZE};
pub use receiver::{ReceiveReport, Receiver, ReceiverConfig};
