use hookpipe_common::IpcError;
use thiserror::Error;

use crate::message::RpcError;

/// Errors surfaced to RPC callers
#[derive(Debug, Error)]
pub enum RpcClientError {
    /// The pipe underneath failed
    #[error("Transport error: {0}")]
    Transport(#[from] IpcError),

    /// Params or result did not match the contract
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server answered with a JSON-RPC error object
    #[error("Remote error: {0}")]
    Remote(#[from] RpcError),

    /// The server sent something other than the expected response
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The notification pump thread died without reporting
    #[error("Notification pump thread panicked")]
    PumpPanicked,
}

impl RpcClientError {
    /// Whether reconnecting and retrying may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcClientError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}
