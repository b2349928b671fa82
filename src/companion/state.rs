//! Companion state machine states and the transitions allowed between them.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompanionState {
    New,
    FetchingStorageInfo,
    RequestingSourceMover,
    WaitingForConnection,
    Transferring,
    AwaitingSourceCompletion,
    /// Cancelled while a copy or a mover request is outstanding
    Cancelled,
    /// Failed while a copy is running; waiting for it to unwind
    Failed,
    Done,
}

impl CompanionState {
    pub fn is_terminal(self) -> bool {
        self == CompanionState::Done
    }

    /// Cancellation or failure already under way.
    pub fn is_unwinding(self) -> bool {
        matches!(self, CompanionState::Cancelled | CompanionState::Failed)
    }

    /// States in which the source mover is kept alive with pings.
    pub fn needs_keepalive(self) -> bool {
        matches!(
            self,
            CompanionState::WaitingForConnection | CompanionState::AwaitingSourceCompletion
        )
    }

    /// States in which the source may connect.
    pub fn accepts_connection(self) -> bool {
        matches!(
            self,
            CompanionState::RequestingSourceMover | CompanionState::WaitingForConnection
        )
    }

    pub fn can_transition_to(self, next: CompanionState) -> bool {
        use CompanionState::*;

        if self.is_terminal() {
            return false;
        }
        if self.is_unwinding() {
            return next == Done;
        }
        match next {
            Cancelled | Failed | Done => true,
            New => false,
            FetchingStorageInfo => self == New,
            RequestingSourceMover => matches!(self, New | FetchingStorageInfo),
            WaitingForConnection => self == RequestingSourceMover,
            Transferring => self.accepts_connection(),
            AwaitingSourceCompletion => self == Transferring,
        }
    }
}

impl fmt::Display for CompanionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompanionState::New => "New",
            CompanionState::FetchingStorageInfo => "FetchingStorageInfo",
            CompanionState::RequestingSourceMover => "RequestingSourceMover",
            CompanionState::WaitingForConnection => "WaitingForConnection",
            CompanionState::Transferring => "Transferring",
            CompanionState::AwaitingSourceCompletion => "AwaitingSourceCompletion",
            CompanionState::Cancelled => "Cancelled",
            CompanionState::Failed => "Failed",
            CompanionState::Done => "Done",
        };
        f.write_str(name)
    }
}
