use std::collections::HashMap;

use hookpipe_common::Connection;
use serde_json::Value;

use crate::{
    contract::{RpcMethod, RpcNotification},
    message::{
        RpcError, RpcMessage, RpcNotificationMessage, RpcRequest, RpcResponse, HANDLER_ERROR,
        INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    },
    naming::{from_wire, to_wire},
};

type MethodFn = Box<dyn FnMut(Value) -> Result<Value, RpcError> + Send>;
type NotificationFn = Box<dyn FnMut(Value) -> anyhow::Result<()> + Send>;

enum Route {
    Method(MethodFn),
    Notification(NotificationFn),
}

/// Routes decoded frames to typed handlers by method name.
///
/// Handlers are registered up front; the dispatcher then serves as a pipe
/// server handler through [`RpcDispatcher::handle`] or
/// [`RpcDispatcher::into_handler`].
#[derive(Default)]
pub struct RpcDispatcher {
    routes: HashMap<String, Route>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for a request/response method
    pub fn register_method<M, F>(&mut self, mut handler: F) -> &mut Self
    where
        M: RpcMethod,
        F: FnMut(M::Params) -> anyhow::Result<M::Output> + Send + 'static,
    {
        let route = Route::Method(Box::new(move |params| {
            let params: M::Params = from_wire(params)
                .map_err(|e| RpcError::new(INVALID_PARAMS, format!("Invalid params: {e}")))?;
            let output =
                handler(params).map_err(|e| RpcError::new(HANDLER_ERROR, format!("{e:#}")))?;
            to_wire(&output).map_err(|e| {
                RpcError::new(HANDLER_ERROR, format!("Unserializable result: {e}"))
            })
        }));
        self.insert(M::wire_name(), route);
        self
    }

    /// Registers the handler for a one-way notification
    pub fn register_notification<N, F>(&mut self, mut handler: F) -> &mut Self
    where
        N: RpcNotification,
        F: FnMut(N::Params) -> anyhow::Result<()> + Send + 'static,
    {
        let route = Route::Notification(Box::new(move |params| {
            let params: N::Params = from_wire(params)?;
            handler(params)
        }));
        self.insert(N::wire_name(), route);
        self
    }

    fn insert(&mut self, name: String, route: Route) {
        tracing::debug!("Registering RPC route '{}'", name);
        if self.routes.insert(name.clone(), route).is_some() {
            tracing::warn!("RPC route '{}' registered twice, keeping the latest", name);
        }
    }

    /// Whether a route exists for `name` (already in wire form)
    pub fn has_route(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Processes one frame and returns the response frame to send, if any.
    ///
    /// Notifications never produce a response, not even on failure.
    pub fn dispatch(&mut self, frame: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(frame) {
            Err(e) => {
                tracing::warn!("Unparseable RPC frame: {}", e);
                let error = RpcError::new(PARSE_ERROR, format!("Parse error: {e}"));
                Some(RpcResponse::error(None, error))
            }
            Ok(value) => match serde_json::from_value::<RpcMessage>(value) {
                Ok(RpcMessage::Request(request)) => Some(self.dispatch_request(request)),
                Ok(RpcMessage::Notification(notification)) => {
                    self.dispatch_notification(notification);
                    None
                }
                Ok(RpcMessage::Response(response)) => {
                    tracing::warn!("Ignoring unsolicited response with id {:?}", response.id);
                    None
                }
                Err(e) => Some(RpcResponse::error(
                    None,
                    RpcError::new(INVALID_REQUEST, format!("Invalid request: {e}")),
                )),
            },
        }?;

        match serde_json::to_string(&response) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!("Failed to encode RPC response: {}", e);
                None
            }
        }
    }

    fn dispatch_request(&mut self, request: RpcRequest) -> RpcResponse {
        tracing::debug!("RPC call {} '{}'", request.id, request.method);
        let outcome = match self.routes.get_mut(&request.method) {
            Some(Route::Method(handler)) => handler(request.params),
            Some(Route::Notification(_)) => Err(RpcError::new(
                INVALID_REQUEST,
                format!("'{}' is a notification and takes no id", request.method),
            )),
            None => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )),
        };

        match outcome {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(error) => {
                tracing::warn!("RPC call {} '{}' failed: {}", request.id, request.method, error);
                RpcResponse::error(Some(request.id), error)
            }
        }
    }

    fn dispatch_notification(&mut self, notification: RpcNotificationMessage) {
        match self.routes.get_mut(&notification.method) {
            Some(Route::Notification(handler)) => {
                if let Err(e) = handler(notification.params) {
                    tracing::error!("Notification '{}' failed: {:#}", notification.method, e);
                }
            }
            Some(Route::Method(_)) => {
                tracing::warn!("'{}' is a method, dropping id-less call", notification.method);
            }
            None => tracing::warn!("No handler for notification '{}'", notification.method),
        }
    }

    /// Pipe server handler: dispatch `frame` and write any response back
    pub fn handle(&mut self, frame: &str, connection: &mut Connection) -> anyhow::Result<()> {
        if let Some(response) = self.dispatch(frame) {
            connection.try_send_response(&response);
        }
        Ok(())
    }

    /// Turns the dispatcher into a closure accepted by `NamedPipeServer`
    pub fn into_handler(
        mut self,
    ) -> impl FnMut(&str, &mut Connection) -> anyhow::Result<()> + Send + 'static {
        move |frame: &str, connection: &mut Connection| self.handle(frame, connection)
    }
}
