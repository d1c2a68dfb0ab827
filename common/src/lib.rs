//! hookpipe common library
//!
//! Shared building blocks for the hookpipe server, client and RPC layer:
//!
//! - Pipe names, configuration constants and environment overrides
//! - The transport error taxonomy
//! - Pipe creation strategies and security descriptors
//! - Platform pipes (Unix domain sockets, Windows named pipes)
//! - Line-delimited frame I/O over a single owned pipe
//!
//! # Features
//!
//! - **Cross-platform pipes**: one interface over Unix domain sockets and
//!   Windows named pipes
//! - **Pipe security**: default OS policy or an explicit ACL for sandboxed and
//!   cross-user peers
//! - **Deterministic close**: every pipe is released through one routine

/// Configuration constants, pipe names and builders
pub mod config;

/// Line framing over a connected pipe
pub mod connection;

/// Transport error taxonomy
pub mod error;

/// Pipe creation strategies
pub mod platform;

/// Platform-specific pipe implementations
pub mod platform_socket;

/// Access-control descriptors for pipes
pub mod security;

// Re-export commonly used types for convenience
pub use config::{ClientConfig, PipeName, PipeSecurityMode, ServerConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{IpcError, Result};
pub use platform::{select_platform, DefaultPipePlatform, PipePlatform, SandboxedPipePlatform};
pub use platform_socket::{ClientCredentials, PipeBreaker, PipeListener, PipeStream};
pub use security::{PipeAccess, PipeAccessRule, PipeIdentity, PipeSecurityDescriptor};
