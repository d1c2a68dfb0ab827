//! hookpipe client library
//!
//! This crate provides the client end of a hookpipe named pipe: a bounded
//! connect that treats "server not there yet" as an ordinary outcome, and
//! synchronous request/response exchange of line-delimited frames over Unix
//! domain sockets or Windows named pipes.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use hookpipe_client::{ClientConfig, NamedPipeClient, PipeName};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::new().with_read_timeout(Some(Duration::from_secs(5)));
//! let mut client = NamedPipeClient::with_config(PipeName::new("hookpipe-demo")?, config);
//!
//! if client.connect(Duration::from_secs(3))? {
//!     client.send_request("hello")?;
//!     println!("Server said: {}", client.read_raw_response()?);
//! }
//!
//! client.dispose();
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export the types callers need to talk to a server
pub use hookpipe_common::{ClientConfig, IpcError, PipeName, Result};
