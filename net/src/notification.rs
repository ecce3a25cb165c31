/*
The events a connection reports about itself, and the sink that receives them.

Every event for one channel is produced by that channel's worker thread in the order
Begin, Connected, DataIn..., End. Events for different channels interleave freely.
*/

use std::{
    fmt,
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
};

use crate::{
    byte_stream::{ByteStream, StreamResult},
    data_types::{ByteCount, ChannelId},
    sockets::transport::Transport,
};

pub enum Notification {
    /// The worker thread for this channel started
    Begin { channel_id: ChannelId },

    /// The connection is established and sends go straight to the peer
    Connected { channel_id: ChannelId },

    /// More bytes arrived. `data` is the channel's receive accumulator, not a copy.
    DataIn { channel_id: ChannelId, data: Inbound },

    /// A listener accepted a connection that has no channel yet
    Accepted { transport: Arc<dyn Transport> },

    /// The worker has exited and nothing more will be reported for this channel
    End { channel_id: ChannelId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Begin,
    Connected,
    DataIn,
    Accepted,
    End,
}

impl Notification {
    pub fn kind(self: &Self) -> NotificationKind {
        match self {
            Notification::Begin { .. } => NotificationKind::Begin,
            Notification::Connected { .. } => NotificationKind::Connected,
            Notification::DataIn { .. } => NotificationKind::DataIn,
            Notification::Accepted { .. } => NotificationKind::Accepted,
            Notification::End { .. } => NotificationKind::End,
        }
    }

    /// The channel this event belongs to. Accepted connections have no channel yet.
    pub fn channel_id(self: &Self) -> Option<ChannelId> {
        match self {
            Notification::Begin { channel_id }
            | Notification::Connected { channel_id }
            | Notification::DataIn { channel_id, .. }
            | Notification::End { channel_id } => Some(*channel_id),
            Notification::Accepted { .. } => None,
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Begin { channel_id } => write!(f, "Begin({channel_id})"),
            Notification::Connected { channel_id } => write!(f, "Connected({channel_id})"),
            Notification::DataIn { channel_id, data } => {
                write!(f, "DataIn({channel_id}, {} bytes)", data.size())
            }
            Notification::Accepted { transport } => match transport.peer_addr() {
                Some(addr) => write!(f, "Accepted({addr})"),
                None => write!(f, "Accepted"),
            },
            Notification::End { channel_id } => write!(f, "End({channel_id})"),
        }
    }
}

/// Receives notifications. Invoked concurrently from many worker threads and inline on
/// them, so implementations must be thread safe and must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(self: &Self, notification: Notification);
}

/// Handle to a channel's receive accumulator. Bytes that are not consumed stay in the
/// stream and are presented again with the next `DataIn`, which lets the consumer wait
/// for a complete message.
#[derive(Clone, Default)]
pub struct Inbound {
    stream: Arc<Mutex<ByteStream>>,
}

impl Inbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(self: &Self) -> ByteCount {
        self.lock().size()
    }

    /// Runs `f` over the unconsumed bytes while the worker is kept from appending
    pub fn peek<R>(self: &Self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.lock().view())
    }

    /// Marks the first `count` bytes as processed
    pub fn consume(self: &Self, count: ByteCount) -> StreamResult<()> {
        self.lock().consume(count)
    }

    /// Copies out and consumes everything currently buffered
    pub fn take(self: &Self) -> Vec<u8> {
        let mut stream = self.lock();
        let bytes = stream.view().to_vec();
        stream.reset();
        bytes
    }

    pub(crate) fn append(self: &Self, bytes: &[u8]) -> StreamResult<()> {
        self.lock().append(bytes)
    }

    fn lock(self: &Self) -> std::sync::MutexGuard<'_, ByteStream> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A sink that queues notifications on an mpsc channel so that the consumer can drain
/// them on its own schedule
pub struct QueueSink {
    sender: Mutex<Sender<Notification>>,
}

impl NotificationSink for QueueSink {
    fn notify(self: &Self, notification: Notification) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        // A dropped receiver means nobody is listening any more
        let _ = sender.send(notification);
    }
}

pub fn notification_queue() -> (Arc<QueueSink>, Receiver<Notification>) {
    let (sender, receiver) = channel::<Notification>();
    (Arc::new(QueueSink { sender: Mutex::new(sender) }), receiver)
}
