//! Periodic delivery of queued events as batched notifications.

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, select, tick, Sender};
use hookpipe_common::{config::MAX_FRAME_LEN, IpcError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
    client::RpcClient, contract::RpcNotification, error::RpcClientError, message::RpcMessage,
    naming::to_wire, queue::EventQueue,
};

/// Flush interval used when the caller doesn't pick one
pub const DEFAULT_PUMP_INTERVAL: Duration = Duration::from_millis(500);

/// What a pump delivered before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub batches_sent: u64,
    pub events_sent:  u64,
}

/// Background thread that drains an [`EventQueue`] every interval and sends
/// each non-empty drain as one `N` notification.
///
/// The pump stops when asked (after a final flush) or on the first transport
/// failure; events in the failed batch are dropped.
pub struct NotificationPump {
    stop:   Option<Sender<()>>,
    thread: Option<JoinHandle<Result<PumpSummary, RpcClientError>>>,
}

impl NotificationPump {
    /// Starts pumping with the default 500 ms interval
    pub fn start<N, T>(client: RpcClient, queue: EventQueue<T>) -> Result<Self, RpcClientError>
    where
        N: RpcNotification<Params = Vec<T>>,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Self::with_interval::<N, T>(client, queue, DEFAULT_PUMP_INTERVAL)
    }

    pub fn with_interval<N, T>(
        mut client: RpcClient,
        queue: EventQueue<T>,
        interval: Duration,
    ) -> Result<Self, RpcClientError>
    where
        N: RpcNotification<Params = Vec<T>>,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let method = N::wire_name();

        let thread = thread::Builder::new()
            .name(format!("hookpipe-pump-{method}"))
            .spawn(move || {
                let ticker = tick(interval);
                let mut summary = PumpSummary::default();
                tracing::debug!("Notification pump for '{}' every {:?}", method, interval);

                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Err(e) = flush::<N, T>(&mut client, &queue, &mut summary) {
                                tracing::error!(
                                    "Notification pump for '{}' stopped: {}",
                                    method,
                                    e
                                );
                                return Err(e);
                            }
                        }
                        // Either an explicit stop or the pump handle went away
                        recv(stop_rx) -> _ => break,
                    }
                }

                flush::<N, T>(&mut client, &queue, &mut summary)?;
                tracing::debug!(
                    "Notification pump for '{}' finished: {} batches, {} events",
                    method,
                    summary.batches_sent,
                    summary.events_sent
                );
                Ok(summary)
            })
            .map_err(IpcError::from)?;

        Ok(Self {
            stop:   Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Whether the pump thread is still delivering
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Flushes what's left, stops the thread and reports what was delivered.
    ///
    /// Returns the transport error if the pump had already died on one.
    pub fn stop(mut self) -> Result<PumpSummary, RpcClientError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<PumpSummary, RpcClientError> {
        if let Some(stop) = self.stop.take() {
            // The thread may already be gone after a transport failure
            let _ = stop.send(());
        }
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| RpcClientError::PumpPanicked)?,
            None => Ok(PumpSummary::default()),
        }
    }
}

impl Drop for NotificationPump {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Notification pump ended with error: {}", e);
        }
    }
}

/// Sends everything queued, split across as many notifications as it takes
/// to keep each frame within [`MAX_FRAME_LEN`].
///
/// An event too large to travel even on its own is logged and dropped; only
/// transport failures end the pump.
fn flush<N, T>(
    client: &mut RpcClient,
    queue: &EventQueue<T>,
    summary: &mut PumpSummary,
) -> Result<(), RpcClientError>
where
    N: RpcNotification<Params = Vec<T>>,
    T: Serialize,
{
    let batch = queue.drain();
    if batch.is_empty() {
        return Ok(());
    }

    let method = N::wire_name();
    let mut chunks = FrameChunks::new(&method)?;
    for event in &batch {
        let encoded = serde_json::to_string(&to_wire(event)?)?;
        if let Some(frame) = chunks.push(encoded) {
            send_chunk(client, &method, frame, summary)?;
        }
    }
    if let Some(frame) = chunks.finish() {
        send_chunk(client, &method, frame, summary)?;
    }
    Ok(())
}

fn send_chunk(
    client: &mut RpcClient,
    method: &str,
    (frame, count): (String, u64),
    summary: &mut PumpSummary,
) -> Result<(), RpcClientError> {
    match client.notify_frame(&frame) {
        Ok(()) => {
            summary.batches_sent += 1;
            summary.events_sent += count;
            tracing::trace!("Sent batch of {} events", count);
            Ok(())
        }
        Err(RpcClientError::Transport(IpcError::InvalidFrame(reason))) => {
            tracing::error!("Dropping {} '{}' events: {}", count, method, reason);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Packs pre-encoded events into notification frames no longer than
/// [`MAX_FRAME_LEN`]
struct FrameChunks {
    /// Frame text before and after the params array
    head:   String,
    tail:   String,
    events: Vec<String>,
    /// Encoded length of the frame holding `events`
    len:    usize,
}

impl FrameChunks {
    fn new(method: &str) -> serde_json::Result<Self> {
        let empty = RpcMessage::notification(method, Value::Array(Vec::new())).to_frame()?;
        // params is serialized last, so the final "[]" is its array
        let (head, tail) = empty.rsplit_once("[]").unwrap_or((empty.as_str(), ""));
        Ok(Self {
            head:   format!("{head}["),
            tail:   format!("]{tail}"),
            events: Vec::new(),
            len:    empty.len(),
        })
    }

    fn empty_len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    /// Adds one event, returning the finished frame it didn't fit into
    fn push(&mut self, event: String) -> Option<(String, u64)> {
        if self.empty_len() + event.len() > MAX_FRAME_LEN {
            tracing::error!("Dropping event of {} bytes, larger than a frame", event.len());
            return None;
        }

        let separator = usize::from(!self.events.is_empty());
        let full = if self.len + separator + event.len() > MAX_FRAME_LEN {
            self.take()
        } else {
            None
        };
        self.len += usize::from(!self.events.is_empty()) + event.len();
        self.events.push(event);
        full
    }

    fn finish(mut self) -> Option<(String, u64)> {
        self.take()
    }

    fn take(&mut self) -> Option<(String, u64)> {
        if self.events.is_empty() {
            return None;
        }
        let count = self.events.len() as u64;
        let frame = format!("{}{}{}", self.head, self.events.join(","), self.tail);
        self.events.clear();
        self.len = self.empty_len();
        Some((frame, count))
    }
}
