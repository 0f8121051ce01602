//! # Client Errors
//!
//! Purpose: One error type for every layer of the client, with enough
//! classification for the pipeline executor to decide between retrying,
//! evicting a connection, or surfacing the failure.
//!
//! ## Design Principles
//! 1. **Transport vs. Reply**: Server error replies are values (`RespValue::Error`),
//!    not `ClientError`s, unless a facade call asks for a typed result.
//! 2. **Explicit Classification**: `is_end_of_stream` drives the stale-connection
//!    retry; `is_connection_fatal` drives pool eviction; `Protocol` vs. `Desync`
//!    decides whether the remaining replies of a batch can still be read.

use std::io;

use thiserror::Error;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Malformed reply whose bytes were fully consumed; the next reply is
    /// still aligned.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Malformed reply that left an unknown number of its bytes unread, so
    /// nothing after it on the stream can be attributed to a command.
    #[error("protocol error, stream out of sync: {0}")]
    Desync(&'static str),
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be resolved into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Client configuration could not be parsed.
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns true when the peer closed the stream before a full reply arrived.
    ///
    /// This is the only condition the pipeline treats as a stale pooled
    /// connection worth one reconnect.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ClientError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// Returns true when the connection that produced this error must not be
    /// handed back to the pool.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Protocol(_) | ClientError::Desync(_)
        )
    }

    pub(crate) fn closed_by_peer() -> Self {
        ClientError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ))
    }
}
