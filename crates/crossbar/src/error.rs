//! Error types for the router.

use crate::codec::TypeDescriptor;
use crate::id::Ident;

use thiserror::Error;

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for router operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A sender endpoint is already attached under this identifier.
    #[error("identifier already attached: {0}")]
    DuplicateId(Ident),

    /// No endpoint is attached under this identifier.
    #[error("unknown identifier: {0}")]
    UnknownId(Ident),

    /// The element type of the queue does not match the type already
    /// registered under the identifier.
    #[error("element type mismatch on {id}: expected {expected}, found {found}")]
    TypeMismatch {
        /// The identifier the attachment was made under.
        id: Ident,
        /// The element type already registered under the identifier.
        expected: TypeDescriptor,
        /// The element type of the offending queue.
        found: TypeDescriptor,
    },

    /// A flow window was created with zero credit.
    #[error("invalid flow credit: {0}")]
    InvalidCredit(usize),

    /// The wrapped queue cannot buffer a full flow window.
    #[error("insufficient buffering for flow credit {credit}: queue capacity {capacity}")]
    InsufficientBuffer {
        /// The requested credit window.
        credit: usize,
        /// The capacity of the wrapped queue.
        capacity: usize,
    },

    /// The byte transport failed.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// A value could not be encoded for the wire.
    #[error("marshal failure: {0}")]
    Marshal(String),

    /// A wire frame could not be decoded.
    #[error("demarshal failure: {0}")]
    Demarshal(String),

    /// The queue (or the router owning it) has been closed.
    #[error("channel closed")]
    ClosedChannel,
}
