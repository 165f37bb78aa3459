use std::fmt;

use mapstore::MetaError;

/// Errors the engine can hand back to a request or an admin message.
#[derive(Debug, Clone)]
pub enum PoolError {
    NoSpace,
    NotFound,
    IoError(String),
    Corrupt(String),
    Invalid(String),
    /// Never returned to a caller in this implementation: Rust's global
    /// allocator aborts the process on true allocation failure rather than
    /// handing back a catchable error, so the source's slab-allocator
    /// exhaustion path has no reachable counterpart here. Kept for parity
    /// with the store's own error kinds.
    OutOfMemory,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::NoSpace => write!(f, "pool is out of data space"),
            PoolError::NotFound => write!(f, "not found"),
            PoolError::IoError(msg) => write!(f, "I/O error: {msg}"),
            PoolError::Corrupt(msg) => write!(f, "metadata corrupt: {msg}"),
            PoolError::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            PoolError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<MetaError> for PoolError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::NoSpace => PoolError::NoSpace,
            MetaError::NotFound => PoolError::NotFound,
            MetaError::IoError(msg) => PoolError::IoError(msg),
            MetaError::Corrupt(msg) => PoolError::Corrupt(msg),
            MetaError::Invalid(msg) => PoolError::Invalid(msg),
            MetaError::WouldBlock => {
                PoolError::IoError("metadata reported would-block outside the fast path".into())
            }
        }
    }
}
