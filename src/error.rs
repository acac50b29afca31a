//! Error types for the multiplexer core.
//!
//! Errors are stage-specific rather than pooled into one monolithic enum.
//! All public enums are `#[non_exhaustive]` so variants can be added without
//! breaking callers; consumers should include a fallback match arm.
//!
//! # Design Notes
//! - Connection-level I/O failures and protocol desyncs never surface here:
//!   the loop absorbs them into reconnects. Only poller failure and shutdown
//!   escape `handle_io`.
//! - `ProtocolError` is attributable to the operation currently decoding;
//!   I/O errors are attributable to the connection. The split drives two
//!   different recovery paths, so it is kept explicit all the way down.

use std::fmt;
use std::io;

/// Errors surfaced by [`ClusterMux::handle_io`](crate::ClusterMux::handle_io).
#[derive(Debug)]
#[non_exhaustive]
pub enum MuxError {
    /// The mux has been shut down; no further I/O will be performed.
    ShutDown,
    /// The readiness poller itself failed.
    Poll(io::Error),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutDown => write!(f, "multiplexer is shut down"),
            Self::Poll(err) => write!(f, "poll failed: {err}"),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Poll(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors returned to producer threads from
/// [`Submitter::submit`](crate::Submitter::submit).
#[derive(Debug)]
#[non_exhaustive]
pub enum SubmitError {
    /// The mux has been shut down; the operation was not enqueued.
    ShutDown,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutDown => write!(f, "submission rejected: multiplexer is shut down"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// A decoder rejected bytes on an otherwise healthy connection.
///
/// Unlike an I/O failure this is attributable to the current read operation,
/// but any desync leaves the stream position unknowable, so the connection
/// is recycled once the consecutive-error threshold is reached.
#[derive(Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Bytes arrived with no operation awaiting a response.
    UnexpectedBytes,
    /// The decoder rejected the response stream.
    ///
    /// `detail` carries human-readable context and is not stable for
    /// machine parsing.
    Desync { detail: String },
}

impl ProtocolError {
    /// Creates a desync variant from anything stringifiable.
    #[inline]
    pub fn desync(detail: impl Into<String>) -> Self {
        Self::Desync {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedBytes => write!(f, "bytes received with no pending read operation"),
            Self::Desync { detail } => write!(f, "protocol desync: {detail}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Read-path failure split. Io poisons the connection immediately; Protocol
/// counts against the consecutive-error threshold first.
#[derive(Debug)]
pub(crate) enum ReadError {
    Io(io::Error),
    Protocol(ProtocolError),
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ReadError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "read failed: {err}"),
            Self::Protocol(err) => write!(f, "{err}"),
        }
    }
}
