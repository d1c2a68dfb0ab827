use std::{env, fmt, path::PathBuf, time::Duration};

use uuid::Uuid;

use crate::error::{IpcError, Result};

/// Directory that holds Unix socket endpoints, overridable for sandboxed hosts
pub const PIPE_DIR_ENV: &str = "HOOKPIPE_PIPE_DIR";
const DEFAULT_PIPE_DIR: &str = "/tmp";

/// Selects the pipe security strategy at startup (`default` or `sandboxed`)
pub const PIPE_SECURITY_ENV: &str = "HOOKPIPE_PIPE_SECURITY";

/// Connect bound used by callers that don't pick their own
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Read/write bound applied to client pipes and to server-side writes
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a waiting client retries a pipe that isn't there yet
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// How often an idle accept loop checks its shutdown flag
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Largest frame accepted from a peer, terminator excluded
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const MAX_NAME_LEN: usize = 100;

pub(crate) fn pipe_dir() -> PathBuf {
    env::var(PIPE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PIPE_DIR))
}

/// A validated pipe name, unique within the OS pipe namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeName(String);

impl PipeName {
    /// Validates a caller-chosen pipe name.
    pub fn new<S: Into<String>>(name: S) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name.len() > MAX_NAME_LEN {
            Some("name is longer than 100 bytes")
        } else if name.contains(['/', '\\']) {
            Some("name contains a path separator")
        } else if name.chars().any(char::is_control) {
            Some("name contains a control character")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(IpcError::InvalidName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// Generates a collision-free name, used by test harnesses and demos.
    ///
    /// Path separators and control characters in `prefix` become `-`, and
    /// the prefix is cut so the result stays within the name length limit.
    pub fn unique(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let budget = MAX_NAME_LEN - suffix.len() - 1;

        let mut name = String::with_capacity(MAX_NAME_LEN);
        for c in prefix.chars() {
            let c = if c == '/' || c == '\\' || c.is_control() { '-' } else { c };
            if name.len() + c.len_utf8() > budget {
                break;
            }
            name.push(c);
        }
        name.push('-');
        name.push_str(&suffix);
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem location of the Unix socket backing this name
    #[cfg(unix)]
    pub fn socket_path(&self) -> PathBuf {
        pipe_dir().join(&self.0)
    }

    /// Full Win32 pipe path for this name
    #[cfg(windows)]
    pub fn pipe_path(&self) -> String {
        format!(r"\\.\pipe\{}", self.0)
    }
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for PipeName {
    type Error = IpcError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for PipeName {
    type Error = IpcError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

/// Which pipe security strategy the host process runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeSecurityMode {
    /// Let the OS apply its default access policy
    #[default]
    Default,
    /// Build an explicit ACL wide enough for sandboxed or cross-user peers
    Sandboxed,
}

impl PipeSecurityMode {
    /// Reads HOOKPIPE_PIPE_SECURITY, falling back to `Default` for unset or
    /// unknown values
    pub fn from_env() -> Self {
        match env::var(PIPE_SECURITY_ENV) {
            Ok(value) => Self::parse(&value).unwrap_or_else(|| {
                tracing::warn!(
                    "Unknown {} value '{}', using default pipe security",
                    PIPE_SECURITY_ENV,
                    value
                );
                Self::Default
            }),
            Err(_) => Self::Default,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "sandboxed" | "sandbox" | "appcontainer" => Some(Self::Sandboxed),
            _ => None,
        }
    }
}

/// Configuration for a pipe client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on a single blocking read, `None` blocks until data or close
    pub read_timeout:  Option<Duration>,
    /// Bound on a single blocking write
    pub write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_timeout:  Some(DEFAULT_IO_TIMEOUT),
            write_timeout: Some(DEFAULT_IO_TIMEOUT),
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Configuration for a pipe server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bound on writing a response to a slow peer
    pub write_timeout: Option<Duration>,
    /// Accept loop thread name
    pub thread_name:   String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            write_timeout: Some(DEFAULT_IO_TIMEOUT),
            thread_name:   "hookpipe-accept".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response write timeout
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the accept thread name
    pub fn with_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.thread_name = name.into();
        self
    }
}
