//! Unified error handling for the sblock transport.
//!
//! Every fallible operation in the crate returns [`SblockError`]; callers can
//! match on the transient variants (`NoData`, `WouldBlock`, `Timeout`) to
//! drive retry loops without string inspection.

use thiserror::Error;

/// Main error type for sblock operations.
#[derive(Debug, Error)]
pub enum SblockError {
    /// Channel has not completed the handshake, or the peer closed it.
    /// Retryable once the peer (re)connects.
    #[error("channel not ready")]
    NotReady,

    /// No buffer available right now; poll-mode (`timeout == 0`) result.
    #[error("no buffer available")]
    NoData,

    /// Lost a race against another caller (or the channel state changed
    /// between wake-up and re-check); retry.
    #[error("operation would block")]
    WouldBlock,

    /// Bounded wait expired before a buffer became available.
    #[error("wait timed out")]
    Timeout,

    /// Shared-memory allocation failed during channel creation. Fatal for
    /// the creation attempt; nothing is left behind.
    #[error("shared memory allocation failed: {0}")]
    Alloc(String),

    /// Mapping an existing shared-memory region failed.
    #[error("shared memory mapping failed: {0}")]
    Map(String),

    /// The channel was forced out of `Ready` while this call was blocked
    /// (peer vanished or the channel was destroyed). Fatal for the call,
    /// not necessarily for the channel.
    #[error("channel reset while waiting")]
    Reset,

    /// A control message arrived in a state that does not accept it. The
    /// message is dropped and the channel continues.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A channel already exists for this (core, channel) pair.
    #[error("channel already exists: core {core} channel {channel}")]
    AlreadyExists { core: u8, channel: u8 },

    /// Underlying OS error from the shared-memory backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SblockError>;
