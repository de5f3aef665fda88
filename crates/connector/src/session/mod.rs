//! Per-connection session management.
//!
//! A session owns the request and response queues of one connection, drives
//! non-blocking reads and writes on its transport, and runs the processing
//! worker that hands complete requests to the request processor.

mod manager;
mod timer;
mod worker;

pub use manager::{SessionManager, SessionSettings};
pub use timer::IdleTimer;

use std::io;

use protocol::{command_name, ProtocolError};
use thiserror::Error;

/// Errors raised by session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No progress possible until the next readiness event.
    #[error("operation would block")]
    TryAgain,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    Reset,

    /// Any other transport failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The byte stream can no longer be framed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A `process_*` call before `init`.
    #[error("session not initialised")]
    NotInitialised,

    /// The first packet of a connection does not open an exchange.
    #[error("cannot start a processor for {}", command_name(*.0))]
    ProcessorInit(i32),
}

impl SessionError {
    /// Map a transport I/O error onto the session taxonomy.
    pub fn from_transport(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => SessionError::TryAgain,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => SessionError::Reset,
            io::ErrorKind::UnexpectedEof => SessionError::Closed,
            _ => SessionError::Io(err),
        }
    }

    /// Whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::TryAgain | SessionError::ProcessorInit(_)
        )
    }
}
