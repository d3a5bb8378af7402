//! Error types for replica operations.

use core::fmt;

use thiserror::Error;

/// Which half of a delta an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A key/value insertion.
    Insertion,
    /// A tombstone for a previous insertion.
    Deletion,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insertion => f.write_str("insertion"),
            Self::Deletion => f.write_str("deletion"),
        }
    }
}

/// Errors raised by replicas.
///
/// Every error is raised synchronously at the call site and is never retried
/// internally. Re-delivery of a rejected batch belongs to the transport.
#[derive(Debug, Error)]
pub enum Error {
    /// An inbound operation carried a signature that does not verify.
    ///
    /// `index` is the position of the operation within its half of the delta.
    #[error("signature does not match for {operation} #{index} with id {id}")]
    InvalidSignature {
        /// Insertion or deletion.
        operation: OperationKind,
        /// Position inside the insertions or deletions of the batch.
        index: usize,
        /// Debug rendering of the operation identifier.
        id: String,
    },

    /// A method that is disabled on signed replicas was called.
    #[error("unsupported method {0}() on a signed replica")]
    UnsupportedOperation(&'static str),

    /// A live operation has no recorded signature. This is a bookkeeping bug.
    #[error("missing signature for {operation} with id {id}")]
    MissingSignature {
        /// Insertion or deletion.
        operation: OperationKind,
        /// Debug rendering of the operation identifier.
        id: String,
    },

    /// A signed set insertion declared a digest that is not the hash of its value.
    #[error("digest does not match value for insertion #{index}")]
    DigestMismatch {
        /// Position inside the insertions of the batch.
        index: usize,
    },

    /// A value or key could not be canonically encoded for hashing or signing.
    #[error("canonical encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A verification key could not be decoded.
    #[error("invalid verification key: {0}")]
    InvalidKey(String),

    /// The identifier generator has no identifier left above the greatest one
    /// observed, so no new local operation can win.
    #[error("identifier space exhausted")]
    IdsExhausted,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
