use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use log::{error, info, warn};
use thiserror::Error;

#[cfg(debug_assertions)]
use log::debug;

use super::{
    connection_thread::{ConnectionThread, Target},
    transport::{Connector, Transport, TransportError},
};
use crate::{
    byte_stream::{ByteStream, StreamError},
    data_types::{ChannelId, PortNumber},
    notification::{Inbound, NotificationSink},
    settings::NetworkSettings,
};

/// States only ever move forward through this list. Connecting and Connected can be
/// skipped, and a failure can jump straight to Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Ready,
    Connecting,
    Connected,
    Stopping,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Ready,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Stopping,
            _ => ConnectionState::Closed,
        }
    }
}

/// Readable from any thread without the connection lock. Only written with the lock
/// held, so transitions stay ordered with the outbound queue and transport.
#[derive(Clone)]
pub(super) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub(super) fn get(self: &Self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(self: &Self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug, PartialEq, Error)]
pub enum ConnectionError {
    #[error("operation is not valid while the connection is {state:?}")]
    InvalidState { state: ConnectionState },

    #[error("send queue is full: {0}")]
    Buffer(StreamError),

    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("unable to start connection thread: {msg}")]
    Spawn { msg: String },
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State shared between a connection and its worker thread, always accessed under
/// the connection's own lock
pub(super) struct ConnectionInner {
    state: StateCell,
    pub(super) outbound: ByteStream,
    pub(super) transport: Option<Arc<dyn Transport>>,
}

impl ConnectionInner {
    pub(super) fn state(self: &Self) -> ConnectionState {
        self.state.get()
    }

    pub(super) fn set_state(self: &mut Self, state: ConnectionState) {
        self.state.set(state);
    }
}

pub(super) type SharedInner = Arc<Mutex<ConnectionInner>>;

pub(super) fn lock_inner(inner: &SharedInner) -> MutexGuard<'_, ConnectionInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One network connection driven by its own worker thread. A connection is used once:
/// after it leaves `Ready` it can not be pointed at another peer.
///
/// All calls return immediately. Progress is reported to the notification sink from the
/// worker thread. Dropping a connection requests a disconnect and waits for the worker
/// to exit, which can take up to one receive timeout.
pub struct Connection {
    channel_id: ChannelId,
    settings: Arc<NetworkSettings>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn NotificationSink>,
    inner: SharedInner,
    state: StateCell,
    inbound: Inbound,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        channel_id: ChannelId,
        settings: &Arc<NetworkSettings>,
        connector: &Arc<dyn Connector>,
        sink: &Arc<dyn NotificationSink>,
    ) -> Self {
        let state = StateCell::new(ConnectionState::Ready);
        Self {
            channel_id,
            settings: settings.clone(),
            connector: connector.clone(),
            sink: sink.clone(),
            inner: Arc::new(Mutex::new(ConnectionInner {
                state: state.clone(),
                outbound: ByteStream::new(),
                transport: None,
            })),
            state,
            inbound: Inbound::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn channel_id(self: &Self) -> ChannelId {
        self.channel_id
    }

    /// Never waits for the connection lock, so it stays fast while a send is blocked
    pub fn state(self: &Self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_closed(self: &Self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Starts connecting to `host:port` on a new worker thread
    pub fn connect(self: &Self, host: &str, port: PortNumber) -> ConnectionResult<()> {
        self.begin_connecting()?;
        info!("Connection {}: Connecting to {host}:{port}", self.channel_id);
        self.start(Target::Remote { host: host.to_owned(), port })
    }

    /// Takes over a transport that is already connected, for example one accepted by a
    /// listener. When the connection is not `Ready` the transport is left untouched and
    /// stays the caller's to close.
    pub fn adopt(self: &Self, transport: Arc<dyn Transport>) -> ConnectionResult<()> {
        self.begin_connecting()?;
        match transport.peer_addr() {
            Some(addr) => info!("Connection {}: Adopting connection from {addr}", self.channel_id),
            None => info!("Connection {}: Adopting connection", self.channel_id),
        }
        self.start(Target::Adopted(transport))
    }

    /// Before the connection is established the bytes are queued and flushed once it
    /// is. There is no delivery guarantee for queued bytes; if connecting fails they are
    /// discarded and only the `End` notification is reported.
    ///
    /// Once connected the bytes are written directly on the calling thread, at most
    /// `max_transfer_size` of them. The number actually written is not reported.
    ///
    /// The connection lock is released before writing, so a slow peer blocks only the
    /// calling thread.
    pub fn send(self: &Self, bytes: &[u8]) -> ConnectionResult<()> {
        let mut inner = lock_inner(&self.inner);
        let state = inner.state();
        match state {
            ConnectionState::Ready | ConnectionState::Connecting => {
                #[cfg(debug_assertions)]
                debug!("Connection {}: Queueing {} bytes until connected", self.channel_id, bytes.len());
                inner.outbound.append(bytes).map_err(ConnectionError::Buffer)
            }
            ConnectionState::Connected => {
                let transport = match &inner.transport {
                    Some(transport) => transport.clone(),
                    None => return Err(ConnectionError::InvalidState { state }),
                };
                drop(inner);

                let max_len = self.settings.max_transfer_size;
                if bytes.len() > max_len {
                    warn!(
                        "Connection {}: Sending {} bytes exceeds the transfer limit, only {max_len} will be sent",
                        self.channel_id,
                        bytes.len()
                    );
                }

                match transport.send(bytes, max_len) {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        warn!("Connection {}: Send failed, disconnecting: {e}", self.channel_id);
                        let mut inner = lock_inner(&self.inner);
                        if inner.state() == ConnectionState::Connected {
                            inner.set_state(ConnectionState::Stopping);
                        }
                        Err(ConnectionError::Transport(e))
                    }
                }
            }
            state => Err(ConnectionError::InvalidState { state }),
        }
    }

    /// Asks the worker to stop. The worker notices at the top of its receive loop, so
    /// the `End` notification follows within one receive timeout.
    pub fn disconnect(self: &Self) -> ConnectionResult<()> {
        let mut inner = lock_inner(&self.inner);
        match inner.state() {
            state @ (ConnectionState::Ready | ConnectionState::Closed) => {
                Err(ConnectionError::InvalidState { state })
            }
            ConnectionState::Stopping => Ok(()),
            ConnectionState::Connecting | ConnectionState::Connected => {
                info!("Connection {}: Disconnect requested", self.channel_id);
                inner.set_state(ConnectionState::Stopping);
                Ok(())
            }
        }
    }

    fn begin_connecting(self: &Self) -> ConnectionResult<()> {
        let mut inner = lock_inner(&self.inner);
        let state = inner.state();
        if state != ConnectionState::Ready {
            return Err(ConnectionError::InvalidState { state });
        }
        inner.set_state(ConnectionState::Connecting);
        Ok(())
    }

    fn start(self: &Self, target: Target) -> ConnectionResult<()> {
        let connection_thread = ConnectionThread::new(
            self.channel_id,
            &self.inner,
            &self.inbound,
            &self.settings,
            &self.connector,
            &self.sink,
            target,
        );

        let spawned = thread::Builder::new()
            .name(format!("channel-{}", self.channel_id))
            .spawn(move || connection_thread.run());

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Connection {}: Failed to start thread: {e}", self.channel_id);
                let mut inner = lock_inner(&self.inner);
                inner.set_state(ConnectionState::Closed);
                inner.outbound.reset();
                Err(ConnectionError::Spawn { msg: e.to_string() })
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.disconnect();

        let handle = self.thread.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            // A sink that drops the last reference from inside a callback runs this on the
            // worker itself, which must not join its own thread
            if handle.thread().id() != thread::current().id() {
                if handle.join().is_err() {
                    error!("Connection {}: Worker thread panicked", self.channel_id);
                }
            }
        }

        #[cfg(debug_assertions)]
        debug!("Connection {}: Dropped", self.channel_id);
    }
}
