use std::fmt::Display;

use crate::task::CacheSlot;

/// A specialized error type for task queue operations.
///
/// Every variant is fatal: the queue does not retry, and a violated
/// accounting invariant on one rank cannot be repaired because peer ranks
/// are counting on the global totals to drain to zero.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// An empty or reversed reference interval was offered for assignment.
    #[error("invalid interval [{begin}, {end}) on rank {rank}")]
    InvalidInterval { rank: usize, begin: u64, end: u64 },
    /// No query subtree in the forest matches the given (begin, count) pair.
    #[error("unknown query subtree (begin {begin}, count {count})")]
    UnknownSubtree { begin: usize, count: usize },
    /// Releasing a cache slot would take its reference count below zero.
    #[error("refcount underflow on cache slot {slot}")]
    RefcountUnderflow { slot: CacheSlot },
    /// The table-exchange transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl QueueError {
    /// Create a transport error from a displayable value.
    pub fn transport<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Transport(msg.to_string())
    }
}

/// A Result type alias for task queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
