//! Unified error type for the vault engine.
//!
//! Every fallible boundary in this crate returns [`Result`]. The [`Error`]
//! enum carries the Kinds the rest of the crate needs to distinguish:
//! crypto failures, not-found/already-exists conditions, lock contention,
//! cache corruption, and backend unavailability. Facade code (`fs`) maps
//! these onto POSIX error codes; nothing else in the crate should need to.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Key material could not be derived or loaded.
    #[error("crypto initialization failed: {0}")]
    CryptoInit(String),

    /// An AEAD tag failed to verify. The ciphertext is either corrupt or has
    /// been tampered with; the plaintext is not recoverable.
    #[error("authentication failed decrypting {what}")]
    AuthFailed { what: String },

    /// An envelope or chunk ended before the expected amount of data was
    /// read.
    #[error("truncated input: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A stream was closed with `lenWritten != lenTotal`.
    #[error("length mismatch: declared {declared} bytes, wrote {written} bytes")]
    LengthMismatch { declared: u64, written: u64 },

    /// No node, blob, or transaction exists at the given address.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Creation was requested for something that already exists.
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// An operation was attempted against a node of the wrong type
    /// (directory where a file was expected, or vice versa).
    #[error("wrong node type: {what}")]
    WrongType { what: String },

    /// A lock could not be acquired because another ticket holds it.
    #[error("lock busy on node {node_id} (held by ticket {holder})")]
    LockBusy { node_id: u64, holder: u64 },

    /// A held ticket no longer matches the lock recorded on the node.
    #[error("stale lock on node {node_id}: ticket {ticket} no longer valid")]
    LockStale { node_id: u64, ticket: u64 },

    /// The on-disk cache is internally inconsistent and cannot be trusted.
    #[error("cache corrupt at {path}: {reason}")]
    CacheCorrupt { path: String, reason: String },

    /// The remote backend could not be reached or returned a transient
    /// failure. Callers may retry.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A long-running operation was cancelled before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// An invariant the crate relies on was violated; this indicates a bug
    /// rather than an environmental condition.
    #[error("internal error: {0}")]
    Internal(String),

    /// Underlying I/O failure, preserved for its `source()` chain.
    #[error("I/O error at {path}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

impl Error {
    #[must_use]
    pub fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Error::Io {
            source,
            path: path.into(),
        }
    }

    /// Whether a retry might succeed without caller-visible state change.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }
}
