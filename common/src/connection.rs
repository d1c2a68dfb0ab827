use std::{
    io::{self, BufRead, BufReader, Read, Write},
    time::Duration,
};

use crate::{
    config::MAX_FRAME_LEN,
    error::{IpcError, Result},
    platform_socket::{ClientCredentials, PipeBreaker, PipeStream},
};

/// Lifecycle state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// A live pipe plus its line framing.
///
/// Each frame is one UTF-8 line terminated by `\n`. Payloads may not contain
/// `\n` or `\r`. The pipe is released by [`Connection::close`], which every
/// teardown path (explicit close, fault, peer disconnect, drop) goes through.
pub struct Connection {
    stream: Option<BufReader<PipeStream>>,
    label:  String,
}

impl Connection {
    /// Wraps a connected pipe; `label` identifies it in logs
    pub fn new<S: Into<String>>(stream: PipeStream, label: S) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            label:  label.into(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Apply read and write bounds to the underlying pipe
    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> Result<()> {
        let stream = self.pipe()?;
        stream.set_read_timeout(read)?;
        stream.set_write_timeout(write)?;
        Ok(())
    }

    pub fn breaker(&self) -> Result<PipeBreaker> {
        Ok(self.pipe()?.breaker()?)
    }

    pub fn peer_credentials(&self) -> Result<ClientCredentials> {
        self.pipe()?.peer_credentials()
    }

    /// Write one frame and flush it.
    ///
    /// A write failure closes the connection.
    pub fn send_frame(&mut self, text: &str) -> Result<()> {
        validate_frame(text)?;
        let stream = self.stream.as_mut().ok_or(IpcError::Closed)?.get_mut();

        let result = stream
            .write_all(text.as_bytes())
            .and_then(|_| stream.write_all(b"\n"))
            .and_then(|_| stream.flush());

        if let Err(e) = result {
            let err = IpcError::from_pipe_io(e);
            tracing::debug!("[{}] write failed: {}", self.label, err);
            self.close();
            return Err(err);
        }
        tracing::trace!("[{}] sent {} byte frame", self.label, text.len());
        Ok(())
    }

    /// Like [`Connection::send_frame`] but reports failure as `false`
    pub fn try_send_response(&mut self, text: &str) -> bool {
        match self.send_frame(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[{}] failed to send response: {}", self.label, e);
                false
            }
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the pipe on a frame boundary.
    /// A close in the middle of a frame is `PipeBroken`. Any error closes the
    /// connection, since the framing state is no longer known.
    pub fn read_frame(&mut self) -> Result<Option<String>> {
        let reader = self.stream.as_mut().ok_or(IpcError::Closed)?;

        let mut line = Vec::new();
        let result = reader
            .by_ref()
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_until(b'\n', &mut line);

        let outcome = match result {
            Ok(0) => Ok(None),
            Ok(_) if line.last() != Some(&b'\n') => {
                if line.len() > MAX_FRAME_LEN {
                    Err(IpcError::InvalidFrame(format!(
                        "frame exceeds {MAX_FRAME_LEN} bytes"
                    )))
                } else {
                    Err(IpcError::PipeBroken(
                        "peer disconnected in the middle of a frame".to_string(),
                    ))
                }
            }
            Ok(_) => {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                String::from_utf8(line)
                    .map(Some)
                    .map_err(|_| IpcError::InvalidFrame("frame is not valid UTF-8".to_string()))
            }
            Err(e) => Err(IpcError::from_pipe_io(e)),
        };

        match &outcome {
            Ok(Some(frame)) => {
                tracing::trace!("[{}] received {} byte frame", self.label, frame.len())
            }
            Ok(None) => {
                tracing::debug!("[{}] peer closed the pipe", self.label);
                self.close();
            }
            Err(e) => {
                tracing::debug!("[{}] read failed: {}", self.label, e);
                self.close();
            }
        }
        outcome
    }

    /// Release the pipe. Safe to call any number of times; only the first
    /// call closes the handle.
    pub fn close(&mut self) {
        if let Some(reader) = self.stream.take() {
            let mut stream = reader.into_inner();
            if let Err(e) = stream.flush() {
                if !matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected) {
                    tracing::debug!("[{}] flush on close failed: {}", self.label, e);
                }
            }
            drop(stream);
            tracing::debug!("[{}] connection closed", self.label);
        }
    }

    fn pipe(&self) -> Result<&PipeStream> {
        self.stream
            .as_ref()
            .map(BufReader::get_ref)
            .ok_or(IpcError::Closed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Checks that `text` can travel as a single frame
pub fn validate_frame(text: &str) -> Result<()> {
    if text.contains(['\n', '\r']) {
        return Err(IpcError::InvalidFrame(
            "payload contains a line terminator".to_string(),
        ));
    }
    if text.len() > MAX_FRAME_LEN {
        return Err(IpcError::InvalidFrame(format!(
            "frame exceeds {MAX_FRAME_LEN} bytes"
        )));
    }
    Ok(())
}
