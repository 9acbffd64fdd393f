//! Error types for tether operations.

use std::fmt;
use std::time::Duration;

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Step of [`Recovery::recover`](crate::Recovery::recover) that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecoveryStage {
    /// Restoring the named snapshot.
    Snapshot,
    /// Reopening the transport.
    Reconnect,
    /// Re-running the freeze sequence.
    Initialize,
}

impl fmt::Display for RecoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Snapshot => "snapshot restore",
            Self::Reconnect => "reconnect",
            Self::Initialize => "re-initialization",
        })
    }
}

/// Errors returned by session, bridge and recovery operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No frame or result arrived before the deadline.
    #[error("{op}: timed out after {after:?}")]
    Timeout {
        /// The operation that was waiting.
        op: &'static str,
        /// How long it waited.
        after: Duration,
    },

    /// The peer closed the transport.
    #[error("connection closed by guest")]
    ConnectionClosed,

    /// Frame accounting broke; the session must reconnect and re-freeze.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// The guest raised a runtime fault while running a command.
    #[error("guest exception: {0}")]
    GuestException(String),

    /// A recovery step failed; the session stays dead.
    #[error("recovery failed during {stage}: {source}")]
    Recovery {
        /// The step that failed.
        stage: RecoveryStage,
        /// The underlying failure.
        #[source]
        source: Box<Self>,
    },

    /// The session was marked dead and needs recovery first.
    #[error("session is dead; recover before issuing commands")]
    SessionDead,

    /// The command wrapper has not been initialized with `freeze`.
    #[error("session is not frozen")]
    NotFrozen,

    /// A launched guest program still owns the command loop.
    #[error("a launched guest program still owns the command loop")]
    Busy,

    /// The command cannot be sent as a single line.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// File data contains the end-of-data byte and cannot be sent raw.
    #[error("file data contains the end-of-data byte 0x04 at offset {offset}")]
    UnsendableData {
        /// Position of the first offending byte.
        offset: usize,
    },

    /// The path is on the transfer deny list.
    #[error("file is banned from transfer: {0}")]
    Denied(String),

    /// The guest answered with something that does not parse.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O error from the transport, snapshot service or bridge server.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` when the session can no longer be used without
    /// reconnecting.
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::ProtocolDesync(_) | Self::SessionDead | Self::Recovery { .. }
        )
    }

    /// Wraps `self` as a failure of recovery `stage`.
    pub(crate) fn during(self, stage: RecoveryStage) -> Self {
        Self::Recovery {
            stage,
            source: Box::new(self),
        }
    }
}
