//! Error types for the tunnel client.

use thiserror::Error;

/// Tunnel client error types
#[derive(Debug, Error)]
pub enum Error {
    /// The client has been shut down; no further dials are possible.
    #[error("client closed")]
    Closed,

    #[error("bad address: {0}")]
    BadAddress(String),

    /// The server refused this particular flow.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// The server refused the handshake; not retried with the same credentials.
    #[error("auth error: {0}")]
    AuthFailed(String),

    #[error("malformed frame")]
    MalformedFrame,

    /// The datagram size cap cannot fit even a single fragment.
    #[error("message too large to fragment")]
    FrameTooLarge,

    #[error("control stream timed out")]
    HandshakeTimeout,

    /// Stream credit on the live connection is exhausted; the connection
    /// itself is healthy, so the caller should simply try again.
    #[error("stream limit reached, try again")]
    StreamLimit,

    /// No connection is established; a previous reconnect attempt failed.
    #[error("not connected")]
    NotConnected,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("QUIC write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("QUIC read error: {0}")]
    Read(#[from] quinn::ReadError),

    #[error("QUIC closed stream: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("QUIC datagram error: {0}")]
    Datagram(#[from] quinn::SendDatagramError),
}

impl Error {
    /// Whether the current connection may still be usable after this error.
    ///
    /// Only explicit try-again signals qualify; everything else is treated
    /// as permanent and takes the single-reconnect path. Stream opens
    /// surface exhausted stream credit as [`Error::StreamLimit`], the one
    /// such signal the transport produces.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Error::StreamLimit)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
