//! Error types for replication.

use labwire_codec::{CodecError, Value};
use thiserror::Error;

/// Result alias for replication operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A mutation that cannot be applied to a structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModError {
    /// A path element indexes past the end of a sequence
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index, as sent
        index: i64,
        /// Length of the sequence
        len: usize,
    },

    /// A mapping has no such key
    #[error("key {0} not found")]
    KeyNotFound(Value),

    /// `remove` found no equal element
    #[error("value {0} not found")]
    ValueNotFound(Value),

    /// Sequences are indexed by integers only
    #[error("sequence index must be an integer, got {0}")]
    InvalidIndex(&'static str),

    /// The action does not apply to the container found at the path
    #[error("cannot {action} on {found}")]
    WrongContainer {
        /// Action name
        action: &'static str,
        /// Type found at the path
        found: &'static str,
    },

    /// The record does not describe a mutation
    #[error("malformed mod: {0}")]
    Malformed(String),
}

/// Errors of publishers, subscribers and broadcast endpoints.
#[derive(Debug, Error)]
pub enum Error {
    /// A received mutation did not apply to the replica
    #[error(transparent)]
    Mod(#[from] ModError),

    /// Connection, TLS or framing failure
    #[error(transparent)]
    Transport(#[from] labwire_rpc::Error),

    /// The publisher has no structure of this name
    #[error("unknown notifier: {0}")]
    UnknownTarget(String),
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Transport(e.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.into())
    }
}
