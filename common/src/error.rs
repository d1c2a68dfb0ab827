//! Error taxonomy shared by the pipe server, client and RPC layer.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors raised by the pipe transport.
#[derive(Debug, Error)]
pub enum IpcError {
    /// A bounded connect attempt expired before a server accepted it
    #[error("Timed out after {timeout:?} connecting to pipe '{name}'")]
    ConnectTimeout { name: String, timeout: Duration },

    /// The peer went away in the middle of a read or write
    #[error("Pipe broken: {0}")]
    PipeBroken(String),

    /// The connection was closed in an orderly way (explicitly or by EOF on a
    /// frame boundary)
    #[error("Connection closed")]
    Closed,

    /// Another live server already owns the pipe name
    #[error("Pipe name '{name}' is already bound by a live server")]
    BindConflict { name: String },

    /// Security descriptor construction was requested on a platform without
    /// a pipe security model
    #[error("Pipe security is not supported on platform '{platform}'")]
    PlatformUnsupported { platform: String },

    /// A server-side handler returned an error or panicked
    #[error("Request handler fault: {0}")]
    HandlerFault(String),

    /// Operation requires a live connection
    #[error("Not connected to pipe server")]
    NotConnected,

    /// A blocking read or write exceeded its configured timeout
    #[error("Timed out waiting on pipe I/O")]
    Timeout,

    /// A frame violated the line protocol
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// A pipe name failed validation
    #[error("Invalid pipe name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Any other OS level failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used across the workspace
pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// Whether the caller may retry by opening a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectTimeout { .. }
                | IpcError::PipeBroken(_)
                | IpcError::Closed
                | IpcError::Timeout
        )
    }

    /// Whether the error is a startup configuration failure
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::BindConflict { .. }
                | IpcError::PlatformUnsupported { .. }
                | IpcError::InvalidName { .. }
        )
    }

    /// Whether the error means the connection it came from is unusable
    pub fn ends_connection(&self) -> bool {
        matches!(
            self,
            IpcError::PipeBroken(_)
                | IpcError::Closed
                | IpcError::Timeout
                | IpcError::Io(_)
        )
    }

    /// Map an I/O error from a live pipe onto the transport taxonomy.
    ///
    /// Disconnect-style kinds become `PipeBroken`, timeouts become `Timeout`,
    /// everything else stays an `Io` error.
    pub fn from_pipe_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => IpcError::PipeBroken(err.to_string()),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => IpcError::Timeout,
            _ => {
                // ERROR_BROKEN_PIPE / ERROR_NO_DATA / ERROR_PIPE_NOT_CONNECTED /
                // ERROR_OPERATION_ABORTED
                #[cfg(windows)]
                if matches!(err.raw_os_error(), Some(109 | 232 | 233 | 995)) {
                    return IpcError::PipeBroken(err.to_string());
                }
                IpcError::Io(err)
            }
        }
    }
}
