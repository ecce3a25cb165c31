/// Aliases for the primitive types used across the crate
pub mod data_types;

/// Growable byte buffer used for send queues and receive accumulators
pub mod byte_stream;

/// Events reported by connections and the sinks that consume them
pub mod notification;

/// Timeouts and sizes, loaded from configuration files and the environment
pub mod settings;

/// Per connection worker threads over blocking sockets, and the inbound listener
pub mod sockets;

/// Channel registry and the multiplexer that owns it
pub mod network;

pub use byte_stream::{ByteStream, StreamError};
pub use data_types::*;
pub use network::{Multiplexer, NetworkError, NetworkResult};
pub use notification::{notification_queue, Inbound, Notification, NotificationKind, NotificationSink};
pub use settings::NetworkSettings;
pub use sockets::connection::{Connection, ConnectionError, ConnectionState};
