//! hookpipe server
//!
//! A [`NamedPipeServer`] owns one pipe name and a dedicated accept thread. Each
//! accepted connection is serviced to completion before the next one is
//! accepted: every inbound frame goes to the user handler, which may answer
//! any number of times through [`Connection::try_send_response`].
//!
//! A handler that returns an error or panics only costs its own connection;
//! the server logs the fault and goes back to accepting.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread::{self, JoinHandle, ThreadId},
};

pub use hookpipe_common::Connection;
use hookpipe_common::{
    config::{ServerConfig, ACCEPT_POLL_INTERVAL},
    platform_socket::wake_listener,
    IpcError, PipeBreaker, PipeListener, PipeName, PipePlatform, Result,
};

/// Request handler run on the accept thread for every inbound frame
pub type Handler = dyn FnMut(&str, &mut Connection) -> anyhow::Result<()> + Send;

/// Counters describing what a server has done so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub requests_handled:     u64,
    pub handler_faults:       u64,
}

#[derive(Default)]
struct Counters {
    connections_accepted: AtomicU64,
    requests_handled:     AtomicU64,
    handler_faults:       AtomicU64,
}

/// State shared between the server handle and its accept thread
struct Shared {
    name:          PipeName,
    shutdown:      AtomicBool,
    /// Breaker for the connection being serviced, if any
    active:        Mutex<Option<PipeBreaker>>,
    counters:      Counters,
    accept_thread: OnceLock<ThreadId>,
}

impl Shared {
    /// Stop accepting and interrupt the active connection. Returns false if a
    /// stop was already requested.
    fn request_stop(&self) -> bool {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("Stopping pipe server '{}'", self.name);

        if let Some(breaker) = self.active.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            breaker.break_pipe();
        }
        wake_listener(&self.name);
        true
    }

    /// Publish the breaker of a newly accepted connection. Returns false when
    /// a stop raced with the accept, in which case the connection must not be
    /// serviced.
    fn register(&self, breaker: Option<PipeBreaker>) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        *active = breaker;
        true
    }

    fn unregister(&self) {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn is_accept_thread(&self) -> bool {
        self.accept_thread.get() == Some(&thread::current().id())
    }
}

/// A named pipe server with one accept thread.
///
/// Dropping the server disposes it.
pub struct NamedPipeServer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NamedPipeServer {
    /// Binds `name` through `platform` and starts serving it with `handler`.
    ///
    /// Binding happens before this returns, so a name already owned by a live
    /// server fails here with `BindConflict`.
    pub fn start_new_server<P, H>(name: &PipeName, platform: &P, handler: H) -> Result<Self>
    where
        P: PipePlatform + ?Sized,
        H: FnMut(&str, &mut Connection) -> anyhow::Result<()> + Send + 'static,
    {
        Self::start_with_config(name, platform, ServerConfig::default(), handler)
    }

    /// Like [`NamedPipeServer::start_new_server`] with explicit configuration
    pub fn start_with_config<P, H>(
        name: &PipeName,
        platform: &P,
        config: ServerConfig,
        handler: H,
    ) -> Result<Self>
    where
        P: PipePlatform + ?Sized,
        H: FnMut(&str, &mut Connection) -> anyhow::Result<()> + Send + 'static,
    {
        let listener = platform.create_pipe(name)?;

        let shared = Arc::new(Shared {
            name:          name.clone(),
            shutdown:      AtomicBool::new(false),
            active:        Mutex::new(None),
            counters:      Counters::default(),
            accept_thread: OnceLock::new(),
        });

        let thread = {
            let shared = shared.clone();
            let handler: Box<Handler> = Box::new(handler);
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || accept_loop(shared, listener, handler, config))?
        };

        tracing::info!("Pipe server '{}' started", name);
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stops accepting, closes the active connection and releases the name.
    ///
    /// Idempotent and callable from any thread, including from inside the
    /// handler. When called from another thread it waits for the accept
    /// thread to finish; from the handler it only requests the stop, which
    /// takes effect once the handler returns.
    pub fn dispose(&self) {
        self.shared.request_stop();

        if self.shared.is_accept_thread() {
            return;
        }
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("Accept thread for '{}' panicked", self.shared.name);
            }
        }
    }

    /// A cloneable handle that can stop the server from anywhere
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn pipe_name(&self) -> &PipeName {
        &self.shared.name
    }

    /// Whether the accept loop is still serving the pipe
    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(Ordering::SeqCst)
            && self
                .thread
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|thread| !thread.is_finished())
    }

    pub fn stats(&self) -> ServerStats {
        let counters = &self.shared.counters;
        ServerStats {
            connections_accepted: counters.connections_accepted.load(Ordering::Relaxed),
            requests_handled:     counters.requests_handled.load(Ordering::Relaxed),
            handler_faults:       counters.handler_faults.load(Ordering::Relaxed),
        }
    }
}

impl Drop for NamedPipeServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Requests a server stop without waiting for it
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shared.request_stop();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

fn accept_loop(
    shared: Arc<Shared>,
    mut listener: PipeListener,
    mut handler: Box<Handler>,
    config: ServerConfig,
) {
    let _ = shared.accept_thread.set(thread::current().id());
    tracing::debug!("Accept loop running for '{}'", shared.name);

    loop {
        let stream = match listener.accept(&shared.shutdown) {
            Ok(Some(stream)) => stream,
            Ok(None) => break,
            Err(e) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tracing::error!("Accept on '{}' failed: {}", shared.name, e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
        };

        let number = shared.counters.connections_accepted.fetch_add(1, Ordering::Relaxed) + 1;
        let mut connection = Connection::new(stream, format!("{}#{}", shared.name, number));
        tracing::info!("[{}] client connected", connection.label());

        if let Err(e) = connection.set_timeouts(None, config.write_timeout) {
            tracing::warn!("[{}] failed to set pipe timeouts: {}", connection.label(), e);
        }
        match connection.peer_credentials() {
            Ok(credentials) => tracing::debug!(
                "[{}] peer pid {}, uid {:?}",
                connection.label(),
                credentials.pid,
                credentials.uid
            ),
            Err(e) => {
                tracing::debug!("[{}] peer credentials unavailable: {}", connection.label(), e)
            }
        }

        let breaker = match connection.breaker() {
            Ok(breaker) => Some(breaker),
            Err(e) => {
                tracing::warn!("[{}] connection cannot be interrupted: {}", connection.label(), e);
                None
            }
        };
        if !shared.register(breaker) {
            connection.close();
            break;
        }

        serve_connection(&shared, &mut connection, handler.as_mut());

        shared.unregister();
        connection.close();
    }

    tracing::info!("Pipe server '{}' stopped", shared.name);
}

/// Feed frames from one connection to the handler until either side closes
fn serve_connection(shared: &Shared, connection: &mut Connection, handler: &mut Handler) {
    while connection.is_open() {
        // A stop requested while the handler ran must not start another read
        if shared.shutdown.load(Ordering::SeqCst) {
            tracing::debug!("[{}] closing for shutdown", connection.label());
            break;
        }
        let request = match connection.read_frame() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    tracing::debug!("[{}] interrupted by shutdown", connection.label());
                } else if matches!(e, IpcError::InvalidFrame(_)) {
                    tracing::warn!("[{}] protocol violation: {}", connection.label(), e);
                } else {
                    tracing::debug!("[{}] connection ended: {}", connection.label(), e);
                }
                break;
            }
        };
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        shared.counters.requests_handled.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&request, connection)));

        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(payload) => Some(format!("handler panicked: {}", panic_message(payload.as_ref()))),
        };
        if let Some(message) = fault {
            let err = IpcError::HandlerFault(message);
            tracing::error!("[{}] {}", connection.label(), err);
            shared.counters.handler_faults.fetch_add(1, Ordering::Relaxed);
            connection.close();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_extracts_strings() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");

        let payload = panic::catch_unwind(|| std::panic::panic_any(3u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn stop_is_requested_once() {
        let shared = Shared {
            name:          PipeName::unique("hookpipe-stop"),
            shutdown:      AtomicBool::new(false),
            active:        Mutex::new(None),
            counters:      Counters::default(),
            accept_thread: OnceLock::new(),
        };
        assert!(shared.request_stop());
        assert!(!shared.request_stop());
        assert!(!shared.register(None));
    }
}
