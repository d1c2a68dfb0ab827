use std::time::Duration;

use hookpipe_client::NamedPipeClient;
use hookpipe_common::{IpcError, PipeName};

use crate::{
    contract::{RpcMethod, RpcNotification},
    error::RpcClientError,
    message::{RequestId, RpcMessage},
    naming::{from_wire, to_wire},
};

/// Typed JSON-RPC calls over a connected [`NamedPipeClient`]
pub struct RpcClient {
    pipe:    NamedPipeClient,
    next_id: u64,
}

impl RpcClient {
    /// Wraps an already connected pipe client
    pub fn new(pipe: NamedPipeClient) -> Self {
        Self { pipe, next_id: 1 }
    }

    /// Connects to `name`, failing with `ConnectTimeout` if no server shows up
    /// within `timeout`
    pub fn connect(name: PipeName, timeout: Duration) -> Result<Self, RpcClientError> {
        let mut pipe = NamedPipeClient::new(name.clone());
        if !pipe.connect(timeout)? {
            return Err(IpcError::ConnectTimeout {
                name: name.to_string(),
                timeout,
            }
            .into());
        }
        Ok(Self::new(pipe))
    }

    /// Calls `M` and waits for its response.
    ///
    /// Responses carrying another id (left over from an abandoned call) and
    /// server-initiated messages are skipped.
    pub fn call<M: RpcMethod>(&mut self, params: &M::Params) -> Result<M::Output, RpcClientError> {
        let id = RequestId::Number(self.next_id);
        self.next_id += 1;

        let method = M::wire_name();
        let frame = RpcMessage::request(id.clone(), method.as_str(), to_wire(params)?).to_frame()?;
        tracing::debug!("RPC call {} '{}'", id, method);
        self.pipe.send_request(&frame)?;

        loop {
            let reply = self.pipe.read_raw_response()?;
            let response = match RpcMessage::from_frame(&reply) {
                Ok(RpcMessage::Response(response)) => response,
                Ok(other) => {
                    tracing::debug!(
                        "Skipping server-initiated message while awaiting {}: {:?}",
                        id,
                        other
                    );
                    continue;
                }
                Err(e) => return Err(RpcClientError::UnexpectedMessage(format!("{e}: {reply}"))),
            };

            match response.id {
                Some(ref reply_id) if *reply_id == id => {}
                Some(ref reply_id) => {
                    tracing::warn!("Skipping stale response {} while awaiting {}", reply_id, id);
                    continue;
                }
                // Server could not read our id, so the error is about this call
                None => {}
            }

            if let Some(error) = response.error {
                return Err(error.into());
            }
            let result = response.result.unwrap_or_default();
            return Ok(from_wire(result)?);
        }
    }

    /// Sends `N` without waiting for anything back
    pub fn notify<N: RpcNotification>(&mut self, params: &N::Params) -> Result<(), RpcClientError> {
        self.notify_frame(&RpcMessage::notification(N::wire_name(), to_wire(params)?).to_frame()?)
    }

    /// Sends an already encoded notification frame
    pub(crate) fn notify_frame(&mut self, frame: &str) -> Result<(), RpcClientError> {
        tracing::trace!("RPC notification, {} bytes", frame.len());
        self.pipe.send_request(frame)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.pipe.is_connected()
    }

    pub fn dispose(&mut self) {
        self.pipe.dispose();
    }

    /// Gives back the underlying pipe client
    pub fn into_inner(self) -> NamedPipeClient {
        self.pipe
    }
}
