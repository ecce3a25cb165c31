use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpListener},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use log::{error, info, warn};
use thiserror::Error;

#[cfg(debug_assertions)]
use log::debug;

use super::transport::TcpTransport;
use crate::{
    data_types::PortNumber,
    notification::{Notification, NotificationSink},
    settings::NetworkSettings,
};

pub const ANY_INTERFACE: &str = "0.0.0.0";

#[derive(Debug, PartialEq, Error)]
pub enum ListenError {
    #[error("failed to listen on {authority}: {msg}")]
    Bind { authority: String, msg: String },

    #[error("unable to start listener thread: {msg}")]
    Spawn { msg: String },
}

pub type ListenResult<T> = Result<T, ListenError>;

struct Running {
    stop_signal: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Accepts inbound connections on a background thread and reports each one to the sink
/// as `Notification::Accepted`. The sink owns the accepted transport from then on.
pub struct Listener {
    settings: Arc<NetworkSettings>,
    sink: Arc<dyn NotificationSink>,
    running: Mutex<Option<Running>>,
}

impl Listener {
    pub fn new(settings: &Arc<NetworkSettings>, sink: &Arc<dyn NotificationSink>) -> Self {
        Self {
            settings: settings.clone(),
            sink: sink.clone(),
            running: Mutex::new(None),
        }
    }

    /// Binds `interface:port` and starts accepting. Any accept loop that was already
    /// running is stopped first. Pass `None` to listen on all interfaces and port 0 to
    /// let the OS choose, then read the actual address from the result.
    pub fn start(self: &Self, interface: Option<&str>, port: PortNumber) -> ListenResult<SocketAddr> {
        self.stop();

        let authority = format!("{}:{port}", interface.unwrap_or(ANY_INTERFACE));
        let bind_error = |e: std::io::Error| ListenError::Bind { authority: authority.clone(), msg: e.to_string() };

        let listener = TcpListener::bind((interface.unwrap_or(ANY_INTERFACE), port)).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let stop_signal = Arc::new(AtomicBool::new(false));
        let listener_thread = ListenerThread::new(listener, &self.settings, &self.sink, &stop_signal);
        let handle = thread::Builder::new()
            .name(format!("listener-{}", local_addr.port()))
            .spawn(move || listener_thread.run())
            .map_err(|e| {
                error!("Listener: Failed to start thread: {e}");
                ListenError::Spawn { msg: e.to_string() }
            })?;

        info!("Listener: Listening on {local_addr}");
        *self.lock() = Some(Running { stop_signal, handle, local_addr });
        Ok(local_addr)
    }

    /// Stops the accept loop and waits for its thread to exit
    pub fn stop(self: &Self) {
        let running = self.lock().take();
        if let Some(running) = running {
            running.stop_signal.store(true, Ordering::Relaxed);
            if running.handle.thread().id() != thread::current().id() {
                if running.handle.join().is_err() {
                    error!("Listener: Accept thread panicked");
                }
            }
            info!("Listener: Stopped listening on {}", running.local_addr);
        }
    }

    pub fn is_running(self: &Self) -> bool {
        self.lock().is_some()
    }

    pub fn local_addr(self: &Self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|running| running.local_addr)
    }

    fn lock(self: &Self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Polls a non-blocking listener so that the stop signal is noticed within one poll
/// interval. Construct with new() then call run() in the thread spawn closure.
struct ListenerThread {
    listener: TcpListener,
    settings: Arc<NetworkSettings>,
    sink: Arc<dyn NotificationSink>,
    stop_signal: Arc<AtomicBool>,
}

impl ListenerThread {
    fn new(
        listener: TcpListener,
        settings: &Arc<NetworkSettings>,
        sink: &Arc<dyn NotificationSink>,
        stop_signal: &Arc<AtomicBool>,
    ) -> Self {
        Self {
            listener,
            settings: settings.clone(),
            sink: sink.clone(),
            stop_signal: stop_signal.clone(),
        }
    }

    fn run(self: Self) {
        info!("ListenerThread: Starting");
        while !self.stop_signal.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    #[cfg(debug_assertions)]
                    debug!("ListenerThread: Accepted connection from {address}");

                    match TcpTransport::new(stream, self.settings.send_timeout()) {
                        Ok(transport) => self.sink.notify(Notification::Accepted { transport: Arc::new(transport) }),
                        Err(e) => warn!("ListenerThread: Dropping connection from {address}: {e}"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.settings.accept_poll_interval());
                }
                Err(e) => {
                    warn!("ListenerThread: Accept failed: {e}");
                    thread::sleep(self.settings.accept_poll_interval());
                }
            }
        }
        info!("ListenerThread: Stopping");
    }
}
