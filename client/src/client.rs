use std::{
    thread,
    time::{Duration, Instant},
};

use hookpipe_common::{
    config::{ClientConfig, CONNECT_RETRY_INTERVAL},
    platform_socket::{connect_pipe, is_pipe_absent},
    Connection, IpcError, PipeName, Result,
};

/// Client end of a hookpipe named pipe.
///
/// Owns at most one [`Connection`]. Requests and responses are exchanged
/// synchronously, one frame at a time, in FIFO order.
pub struct NamedPipeClient {
    name:       PipeName,
    config:     ClientConfig,
    connection: Option<Connection>,
}

impl NamedPipeClient {
    /// Creates a disconnected client for `name` with default timeouts
    pub fn new(name: PipeName) -> Self {
        Self::with_config(name, ClientConfig::default())
    }

    /// Creates a disconnected client with explicit configuration
    pub fn with_config(name: PipeName, config: ClientConfig) -> Self {
        Self {
            name,
            config,
            connection: None,
        }
    }

    pub fn pipe_name(&self) -> &PipeName {
        &self.name
    }

    /// Waits up to `timeout` for a server to accept us.
    ///
    /// Returns `Ok(false)` if nobody is serving the name before the deadline.
    /// Anything other than "pipe not there yet" (permissions, OS errors) is
    /// returned as an error straight away. A timeout too large to add to the
    /// clock, such as `Duration::MAX`, waits without a deadline.
    pub fn connect(&mut self, timeout: Duration) -> Result<bool> {
        if self.is_connected() {
            tracing::debug!("Already connected to '{}'", self.name);
            return Ok(true);
        }

        let deadline = Instant::now().checked_add(timeout);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match connect_pipe(&self.name) {
                Ok(stream) => {
                    let connection = Connection::new(stream, format!("client:{}", self.name));
                    connection.set_timeouts(self.config.read_timeout, self.config.write_timeout)?;
                    tracing::info!("Connected to '{}' after {} attempt(s)", self.name, attempts);
                    self.connection = Some(connection);
                    return Ok(true);
                }
                Err(e) if is_pipe_absent(&e) => {
                    let now = Instant::now();
                    let remaining =
                        deadline.map(|deadline| deadline.saturating_duration_since(now));
                    if remaining == Some(Duration::ZERO) {
                        tracing::debug!(
                            "No server on '{}' within {:?} ({} attempts)",
                            self.name,
                            timeout,
                            attempts
                        );
                        return Ok(false);
                    }
                    let pause = remaining.map_or(CONNECT_RETRY_INTERVAL, |left| {
                        left.min(CONNECT_RETRY_INTERVAL)
                    });
                    thread::sleep(pause);
                }
                Err(e) => {
                    tracing::warn!("Connecting to '{}' failed: {}", self.name, e);
                    return Err(IpcError::Io(e));
                }
            }
        }
    }

    /// Sends one request frame
    pub fn send_request(&mut self, text: &str) -> Result<()> {
        self.live_connection()?.send_frame(text)
    }

    /// Blocks until the next response frame arrives.
    ///
    /// A server that hangs up instead of answering is reported as `PipeBroken`.
    pub fn read_raw_response(&mut self) -> Result<String> {
        match self.live_connection()?.read_frame()? {
            Some(response) => Ok(response),
            None => Err(IpcError::PipeBroken(format!(
                "server '{}' closed the pipe",
                self.name
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_open)
    }

    /// Closes the connection, if any. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            tracing::debug!("Disconnected from '{}'", self.name);
        }
    }

    fn live_connection(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .filter(|connection| connection.is_open())
            .ok_or(IpcError::NotConnected)
    }
}

impl Drop for NamedPipeClient {
    fn drop(&mut self) {
        self.dispose();
    }
}
