//! Crate-level error type.

use crate::buffer::BufferError;
use crate::codec::CodecError;
use crate::split::SplitError;
use crate::transport::TransportError;

/// Result type alias for streaming operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the streaming layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame encode/decode failure.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// Splitting or reassembly failure.
    #[error("split: {0}")]
    Split(#[from] SplitError),

    /// Write-buffer failure, including rejected flushes carrying the
    /// returned rows.
    #[error("buffer: {0}")]
    Buffer(#[from] BufferError),

    /// Transport-level failure.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// The client has been shut down.
    #[error("client is shut down")]
    ClientClosed,

    /// A stream with this id is already open.
    #[error("stream '{0}' is already open")]
    DuplicateStream(String),

    /// The stream is closed or closing.
    #[error("stream '{0}' is closed")]
    StreamClosed(String),
}
