use std::{sync::Arc, thread};

use log::{error, info, warn};

#[cfg(debug_assertions)]
use log::debug;

use super::{
    connection::{lock_inner, ConnectionState, SharedInner},
    transport::{Connector, Transport, TransportError, TransportResult},
    MAX_TX_RETRY_COUNT, TX_RETRY_INTERVAL,
};
use crate::{
    byte_stream::ByteStream,
    data_types::{ChannelId, PortNumber},
    notification::{Inbound, Notification, NotificationSink},
    settings::NetworkSettings,
};

pub(super) enum Target {
    Remote { host: String, port: PortNumber },
    Adopted(Arc<dyn Transport>),
}

/// The worker that owns one connection's blocking I/O. Construct with new() then call
/// run() in the thread spawn closure. Every notification for the channel is emitted from
/// here, which is what keeps them in order.
pub(super) struct ConnectionThread {
    channel_id: ChannelId,
    inner: SharedInner,
    inbound: Inbound,
    settings: Arc<NetworkSettings>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn NotificationSink>,
    target: Option<Target>,
}

impl ConnectionThread {
    pub(super) fn new(
        channel_id: ChannelId,
        inner: &SharedInner,
        inbound: &Inbound,
        settings: &Arc<NetworkSettings>,
        connector: &Arc<dyn Connector>,
        sink: &Arc<dyn NotificationSink>,
        target: Target,
    ) -> Self {
        Self {
            channel_id,
            inner: inner.clone(),
            inbound: inbound.clone(),
            settings: settings.clone(),
            connector: connector.clone(),
            sink: sink.clone(),
            target: Some(target),
        }
    }

    pub(super) fn run(mut self: Self) {
        info!("Connection {}: Thread starting", self.channel_id);
        self.sink.notify(Notification::Begin { channel_id: self.channel_id });

        let transport = match self.target.take() {
            Some(Target::Remote { host, port }) => match self.connector.connect(
                &host,
                port,
                self.settings.connect_timeout(),
                self.settings.send_timeout(),
            ) {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("Connection {}: Failed to connect to {host}:{port}: {e}", self.channel_id);
                    self.finish(None);
                    return;
                }
            },
            Some(Target::Adopted(transport)) => transport,
            None => {
                error!("Connection {}: Thread started without a target", self.channel_id);
                self.finish(None);
                return;
            }
        };

        if !self.establish(&transport) {
            self.finish(Some(transport));
            return;
        }

        self.sink.notify(Notification::Connected { channel_id: self.channel_id });
        info!("Connection {}: Connected", self.channel_id);

        self.receive_loop(&transport);
        self.finish(Some(transport));
    }

    /// Flushes anything queued before the connection was up and moves to Connected. Both
    /// happen under the connection lock so that a concurrent send lands either in the
    /// queue before the flush or directly on the transport after it.
    fn establish(self: &Self, transport: &Arc<dyn Transport>) -> bool {
        let mut inner = lock_inner(&self.inner);

        if inner.state() != ConnectionState::Connecting {
            info!("Connection {}: Disconnected while connecting", self.channel_id);
            return false;
        }

        if !inner.outbound.is_empty() {
            #[cfg(debug_assertions)]
            debug!("Connection {}: Flushing {} queued bytes", self.channel_id, inner.outbound.size());

            if let Err(e) = flush(transport.as_ref(), &mut inner.outbound, self.settings.max_transfer_size) {
                warn!("Connection {}: Failed to send queued bytes: {e}", self.channel_id);
                return false;
            }
        }

        inner.transport = Some(transport.clone());
        inner.set_state(ConnectionState::Connected);
        true
    }

    fn receive_loop(self: &Self, transport: &Arc<dyn Transport>) {
        let timeout = self.settings.receive_timeout();
        let mut buffer = vec![0u8; self.settings.receive_buffer_size];

        while lock_inner(&self.inner).state() == ConnectionState::Connected {
            match transport.receive(&mut buffer, timeout) {
                Ok(0) => {}
                Ok(count) => {
                    #[cfg(debug_assertions)]
                    debug!("Connection {} Rx: Received {count} bytes", self.channel_id);

                    if let Err(e) = self.inbound.append(&buffer[..count]) {
                        error!("Connection {} Rx: {e}", self.channel_id);
                        break;
                    }
                    self.sink.notify(Notification::DataIn {
                        channel_id: self.channel_id,
                        data: self.inbound.clone(),
                    });
                }
                Err(TransportError::Closed) => {
                    info!("Connection {} Rx: Stream closed by other party", self.channel_id);
                    break;
                }
                Err(e) => {
                    warn!("Connection {} Rx: {e}", self.channel_id);
                    break;
                }
            }
        }
    }

    fn finish(self: &Self, transport: Option<Arc<dyn Transport>>) {
        if let Some(transport) = transport {
            transport.close();
        }
        {
            let mut inner = lock_inner(&self.inner);
            inner.set_state(ConnectionState::Closed);
            inner.transport = None;
            inner.outbound.reset();
        }
        info!("Connection {}: Thread stopping", self.channel_id);
        self.sink.notify(Notification::End { channel_id: self.channel_id });
    }
}

/// Writes the whole stream in transfer sized pieces, consuming what was sent
fn flush(transport: &dyn Transport, outbound: &mut ByteStream, max_len: usize) -> TransportResult<()> {
    let mut retry_count = 0;
    while !outbound.is_empty() {
        let sent = transport.send(outbound.view(), max_len)?.min(outbound.size());
        if sent == 0 {
            retry_count += 1;
            if retry_count > MAX_TX_RETRY_COUNT {
                return Err(TransportError::Io { msg: String::from("retry count exceeded flushing queued bytes") });
            }
            thread::sleep(TX_RETRY_INTERVAL);
        } else {
            retry_count = 0;
            // Cannot fail, sent is between 1 and the live size
            let _ = outbound.consume(sent);
        }
    }
    Ok(())
}
