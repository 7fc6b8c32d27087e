//! Error types for dualproc.

use thiserror::Error;

/// Result type for dualproc operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a worker process.
///
/// Failures raised by processor operations are not represented here; they
/// travel back to the caller inside a [`ResultEnvelope`](crate::ResultEnvelope).
#[derive(Debug, Error)]
pub enum Error {
    /// The worker executable could not be found or started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// IPC communication error with the worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// A frame could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The worker answered the handshake with something unexpected, or not at all.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The worker could not construct its processor.
    #[error("processor initialization failed: {0}")]
    InitFailed(String),

    /// The peer closed its end of the channel.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// The channel to the worker is closed; the worker exited or crashed.
    #[error("worker process is gone")]
    WorkerGone,

    /// A call with this key was already submitted.
    #[error("call key {0} is already in use")]
    DuplicateKey(crate::envelope::CallKey),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
