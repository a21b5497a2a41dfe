//! Error types for the bridge transport.
//!
//! Nothing here is ever host-fatal: every variant is scoped to one message,
//! one channel, or one transport instance.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// A single malformed or unknown wire message. The channel stays alive.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The counterpart did not hand the turn back in time. The bridge
    /// instance is considered unresponsive and must be torn down.
    #[error("transport timeout after {waited_ms}ms")]
    TransportTimeout { waited_ms: u64 },

    /// Ring header inconsistency. The whole transport instance is discarded;
    /// a corrupted ring is never partially recovered.
    #[error("malformed ring frame: {0}")]
    MalformedFrame(String),

    /// Shared segment missing or its layout disagrees with ours.
    #[error("failed to attach shared transport: {0}")]
    AttachFailed(String),

    /// The spawned child never sent its first handshake byte.
    #[error("child handshake timed out")]
    HandshakeTimeout,

    /// The other side of the pipe has gone away.
    #[error("control pipe closed by peer")]
    PipeClosed,

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
