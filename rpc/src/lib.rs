//! hookpipe RPC layer
//!
//! JSON-RPC 2.0 shaped calls carried one per frame over hookpipe named pipes.
//!
//! - [`RpcMethod`] / [`RpcNotification`] describe each operation at compile
//!   time; names are normalized to camelCase on the wire
//! - [`RpcDispatcher`] routes inbound frames to typed handlers and plugs into
//!   `NamedPipeServer` as its request handler
//! - [`RpcClient`] issues calls and one-way notifications
//! - [`EventQueue`] and [`NotificationPump`] batch telemetry from a hooked
//!   process and push it to the server periodically
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use hookpipe_rpc::{EventQueue, NotificationPump, PipeName, RpcClient, RpcNotification};
//!
//! struct OnCreateFile;
//!
//! impl RpcNotification for OnCreateFile {
//!     const NAME: &'static str = "OnCreateFile";
//!     type Params = Vec<String>;
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let client = RpcClient::connect(PipeName::new("hookpipe-telemetry")?, Duration::from_secs(3))?;
//! let queue = EventQueue::new();
//! let pump = NotificationPump::start::<OnCreateFile, String>(client, queue.clone())?;
//!
//! queue.push("/etc/hosts".to_string());
//! let summary = pump.stop()?;
//! println!("sent {} events", summary.events_sent);
//! # Ok(())
//! # }
//! ```

mod client;
mod contract;
mod dispatcher;
mod error;
pub mod message;
mod naming;
mod pump;
mod queue;

pub use client::RpcClient;
pub use contract::{RpcMethod, RpcNotification};
pub use dispatcher::RpcDispatcher;
pub use error::RpcClientError;
// Re-export the transport names RPC users need
pub use hookpipe_common::{IpcError, PipeName};
pub use message::{RequestId, RpcError, RpcMessage};
pub use naming::to_camel_case;
pub use pump::{NotificationPump, PumpSummary, DEFAULT_PUMP_INTERVAL};
pub use queue::EventQueue;
