/*
Multiplexes many connections under small integer channel ids, for servers and clients
alike. Outbound connections are created by connect(), inbound ones arrive through the
listener. Every notification from every connection is relayed to one application sink.
*/
pub mod registry;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use log::{info, warn};
use thiserror::Error;

#[cfg(debug_assertions)]
use log::debug;

use registry::{ChannelRegistry, RegistryError};

use crate::{
    data_types::{ChannelId, PortNumber},
    notification::{Notification, NotificationSink},
    settings::NetworkSettings,
    sockets::{
        connection::{Connection, ConnectionError, ConnectionState},
        listener::{ListenError, Listener},
        transport::{Connector, TcpConnector, Transport},
    },
};

const FIRST_CHANNEL_ID: ChannelId = 1;

#[derive(Debug, PartialEq, Error)]
pub enum NetworkError {
    #[error("unknown channel {channel_id}")]
    UnknownChannel { channel_id: ChannelId },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Listen(#[from] ListenError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Owns the channel registry and a listener. All methods run on the calling thread and
/// return without waiting for network activity; outcomes arrive as notifications.
///
/// Connections that reach `Closed` stay registered until the next reclamation pass,
/// which runs before each new connection is registered or when `reclaim()` is called.
pub struct Multiplexer {
    shared: Arc<Shared>,
    listener: Listener,
}

impl Multiplexer {
    pub fn new(settings: &Arc<NetworkSettings>, sink: &Arc<dyn NotificationSink>) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::default());
        Self::with_connector(settings, sink, &connector)
    }

    pub fn with_connector(
        settings: &Arc<NetworkSettings>,
        sink: &Arc<dyn NotificationSink>,
        connector: &Arc<dyn Connector>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let relay: Arc<dyn NotificationSink> = Arc::new(Relay { shared: weak.clone(), sink: sink.clone() });
            Shared {
                settings: settings.clone(),
                connector: connector.clone(),
                registry: ChannelRegistry::new(),
                next_channel_id: AtomicU64::new(FIRST_CHANNEL_ID),
                relay,
            }
        });
        let listener = Listener::new(settings, &shared.relay);
        Self { shared, listener }
    }

    /// Registers a new channel and starts connecting it in the background. `Connected`
    /// or `End` for the returned channel reports the outcome.
    pub fn connect(self: &Self, host: &str, port: PortNumber) -> NetworkResult<ChannelId> {
        let (channel_id, connection) = self.shared.register()?;
        connection.connect(host, port)?;
        Ok(channel_id)
    }

    /// Starts accepting inbound connections, each of which becomes a new channel
    pub fn listen(self: &Self, interface: Option<&str>, port: PortNumber) -> NetworkResult<SocketAddr> {
        Ok(self.listener.start(interface, port)?)
    }

    /// Stops accepting connections. Established channels are unaffected.
    pub fn stop_listening(self: &Self) {
        self.listener.stop();
    }

    pub fn listen_addr(self: &Self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Requests a graceful disconnect. The channel stays registered until it has closed
    /// and a reclamation pass removes it.
    pub fn disconnect(self: &Self, channel_id: ChannelId) -> NetworkResult<()> {
        let connection = self.shared.lookup(channel_id)?;
        // Rejected only when nothing is running, so there is nothing left to stop
        let _ = connection.disconnect();
        Ok(())
    }

    pub fn send(self: &Self, channel_id: ChannelId, bytes: &[u8]) -> NetworkResult<()> {
        let connection = self.shared.lookup(channel_id)?;
        Ok(connection.send(bytes)?)
    }

    /// Stops the listener and asks every channel to disconnect, without waiting for them
    pub fn shutdown(self: &Self) {
        self.listener.stop();
        let connections = self.shared.registry.connections();
        info!("Multiplexer: Shutting down {} channels", connections.len());
        for connection in connections {
            let _ = connection.disconnect();
        }
    }

    /// Removes and destroys closed channels, returning how many were removed
    pub fn reclaim(self: &Self) -> usize {
        self.shared.reclaim()
    }

    pub fn state(self: &Self, channel_id: ChannelId) -> Option<ConnectionState> {
        self.shared.registry.get(channel_id).map(|connection| connection.state())
    }

    pub fn channel_count(self: &Self) -> usize {
        self.shared.registry.len()
    }

    pub fn channel_ids(self: &Self) -> Vec<ChannelId> {
        self.shared.registry.channel_ids()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Shared {
    settings: Arc<NetworkSettings>,
    connector: Arc<dyn Connector>,
    registry: ChannelRegistry,
    next_channel_id: AtomicU64,
    relay: Arc<dyn NotificationSink>,
}

impl Shared {
    /// Allocates a channel id, reclaims closed channels and registers a new connection
    /// under the id. The connection is still `Ready` when this returns.
    fn register(self: &Self) -> NetworkResult<(ChannelId, Arc<Connection>)> {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(channel_id, &self.settings, &self.connector, &self.relay));

        self.reclaim();
        self.registry.insert(connection.clone())?;

        #[cfg(debug_assertions)]
        debug!("Multiplexer: Registered channel {channel_id}");

        Ok((channel_id, connection))
    }

    fn adopt(self: &Self, transport: Arc<dyn Transport>) -> NetworkResult<ChannelId> {
        let (channel_id, connection) = match self.register() {
            Ok(registered) => registered,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        if let Err(e) = connection.adopt(transport.clone()) {
            transport.close();
            return Err(e.into());
        }
        Ok(channel_id)
    }

    fn lookup(self: &Self, channel_id: ChannelId) -> NetworkResult<Arc<Connection>> {
        self.registry.get(channel_id).ok_or(NetworkError::UnknownChannel { channel_id })
    }

    fn reclaim(self: &Self) -> usize {
        let closed = self.registry.remove_where(|connection| connection.state() == ConnectionState::Closed);
        let count = closed.len();
        if count > 0 {
            info!("Multiplexer: Reclaimed {count} closed channels");
        }
        // Dropped here, outside the registry lock, which joins the exited worker threads
        drop(closed);
        count
    }
}

/// The sink given to every connection and to the listener. Accepted connections are
/// turned into channels, everything else goes to the application.
struct Relay {
    shared: Weak<Shared>,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationSink for Relay {
    fn notify(self: &Self, notification: Notification) {
        match notification {
            Notification::Accepted { transport } => match self.shared.upgrade() {
                Some(shared) => match shared.adopt(transport) {
                    Ok(channel_id) => info!("Multiplexer: Accepted connection on channel {channel_id}"),
                    Err(e) => warn!("Multiplexer: Failed to accept connection: {e}"),
                },
                None => transport.close(),
            },
            notification => {
                #[cfg(debug_assertions)]
                debug!("Multiplexer: Relaying {notification:?}");
                self.sink.notify(notification);
            }
        }
    }
}
