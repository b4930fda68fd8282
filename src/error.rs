//! Error taxonomy.
//!
//! - `ServerError`: fatal, stops the service and is returned to the caller.
//! - Transient accept errors: logged by the acceptor, never surfaced here.
//! - `ConnError`: scoped to one connection, which is closed; the service
//!   keeps running.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Errors that stop the server.
#[derive(Debug)]
pub enum ServerError {
    /// The listening socket could not be created or bound.
    Bind { addr: SocketAddr, source: io::Error },
    /// `accept` failed with an error that retrying cannot fix.
    Accept(io::Error),
    /// The worker pool was given an unusable size.
    Pool(&'static str),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Failed binding to {addr}: {source}")
            }
            ServerError::Accept(e) => write!(f, "Error accepting connection: {e}"),
            ServerError::Pool(reason) => write!(f, "Invalid worker pool: {reason}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Accept(e) => Some(e),
            ServerError::Pool(_) => None,
        }
    }
}

/// Errors local to a single connection.
#[derive(Debug)]
pub enum ConnError {
    /// No bytes arrived within the read deadline.
    ReadTimeout(Duration),
    /// Reading from the peer failed.
    Read(io::Error),
    /// The request grew past the configured maximum.
    TooLarge { limit: usize },
    /// The request head could not be framed.
    Malformed(&'static str),
    /// The service did not finish within its deadline.
    WorkTimeout(Duration),
    /// The response could not be written within the write deadline.
    WriteTimeout(Duration),
    /// Writing to the peer failed.
    Write(io::Error),
    /// The connection outlived the handler deadline.
    HandlerTimeout(Duration),
}

impl std::fmt::Display for ConnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnError::ReadTimeout(d) => write!(f, "read timed out after {d:?}"),
            ConnError::Read(e) => write!(f, "error reading from connection: {e}"),
            ConnError::TooLarge { limit } => {
                write!(f, "request exceeds limit of {limit} bytes")
            }
            ConnError::Malformed(reason) => write!(f, "malformed request: {reason}"),
            ConnError::WorkTimeout(d) => write!(f, "work timed out after {d:?}"),
            ConnError::WriteTimeout(d) => write!(f, "write timed out after {d:?}"),
            ConnError::Write(e) => write!(f, "error writing to connection: {e}"),
            ConnError::HandlerTimeout(d) => write!(f, "handler timed out after {d:?}"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Read(e) | ConnError::Write(e) => Some(e),
            _ => None,
        }
    }
}

/// Whether an `accept` error leaves the listener usable.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhaustion(e)
}

/// Out of descriptors or kernel buffers; the acceptor backs off before retrying.
pub fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}
