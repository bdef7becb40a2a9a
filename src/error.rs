//! Crate-wide error type.
//!
//! One variant per semantic failure kind rather than per call site, so that
//! the IPC layer can map any error straight to a wire `Error(kind, message)`
//! response without re-deriving what went wrong from a string.

use serde::{Deserialize, Serialize};

/// Discriminant mirrored onto the wire so clients can branch on failure kind
/// without parsing `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Retryable read/write that should be reposted to the reactor. Never
    /// surfaced to clients directly.
    TransientIo,
    /// A client socket EOFed. Local cleanup only.
    ConnectionLost,
    /// Malformed frame, unknown version, or an id referencing nothing.
    ProtocolViolation,
    /// Could not spawn a PTY, bind a socket, or allocate an id.
    ResourceExhausted,
    /// Named session/pane/split doesn't exist.
    NotFound,
    /// Operation not valid in the current state (e.g. resizing a split that
    /// no longer exists).
    InvalidState,
    /// Corrupt persisted state, unbindable socket, or lock held elsewhere.
    /// Logged and the process exits non-zero.
    Fatal,
}

/// Structured crate error with a machine-readable kind and a human message.
///
/// `thiserror` derives `Display`/`std::error::Error` the same way
/// `TerminalError`/`PtyError` do, just off one format string
/// parameterized over fields rather than one variant per message: the kind
/// enum already carries the per-failure discriminant, and `message` is
/// call-site text that also has to survive the wire as a plain `String`
/// (see `Serialize`), which a `#[error("...")]` per variant would have to
/// duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Set only by [`Error::lock_held`]; distinguishes exit code `3` (another
    /// server owns the lock file) from the generic `2` for other fatal
    /// configuration/environment errors, per spec §6.
    #[serde(default)]
    pub lock_held: bool,
}

impl Error {
    pub fn transient_io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::TransientIo, message: msg.into(), lock_held: false }
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::ConnectionLost, message: msg.into(), lock_held: false }
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::ProtocolViolation, message: msg.into(), lock_held: false }
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::ResourceExhausted, message: msg.into(), lock_held: false }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::NotFound, message: msg.into(), lock_held: false }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::InvalidState, message: msg.into(), lock_held: false }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Fatal, message: msg.into(), lock_held: false }
    }

    /// A fatal error specifically because another live server already holds
    /// the lock file (spec §6, exit code `3`).
    pub fn lock_held(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Fatal, message: msg.into(), lock_held: true }
    }

    /// Process exit code for an error reaching `main`, per the server's
    /// documented exit codes: `1` unexpected I/O error, `2`
    /// configuration/environment unusable, `3` lock already held.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Fatal if self.lock_held => 3,
            ErrorKind::Fatal => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::transient_io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
