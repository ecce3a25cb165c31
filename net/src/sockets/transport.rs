/*
Thin wrapper around the blocking sockets in the standard library. A connection worker
only ever talks to its peer through these traits, which keeps the worker testable and
the socket calls in one place.
*/

use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use log::warn;
use thiserror::Error;

#[cfg(debug_assertions)]
use log::debug;

use crate::data_types::{ByteCount, PortNumber};

#[derive(Debug, PartialEq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("unable to resolve {msg}")]
    Resolve { msg: String },

    #[error("{msg}")]
    Io { msg: String },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A connected byte pipe to one peer. Methods take `&self` so that the worker can block in
/// `receive` while another thread calls `send`.
pub trait Transport: Send + Sync {
    /// Writes at most `max_len` bytes. `Ok(0)` means the OS had no buffer space.
    fn send(&self, buf: &[u8], max_len: ByteCount) -> TransportResult<ByteCount>;

    /// Reads into `buf`, waiting at most `timeout`. `Ok(0)` means the timeout elapsed
    /// without data; a peer that closed the connection is `Err(TransportError::Closed)`.
    fn receive(&self, buf: &mut [u8], timeout: Duration) -> TransportResult<ByteCount>;

    /// Shuts the connection down in both directions. Safe to call more than once.
    fn close(&self);

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Opens outbound transports
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: PortNumber,
        timeout: Duration,
        send_timeout: Duration,
    ) -> TransportResult<Arc<dyn Transport>>;
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps an already connected stream, for example one returned by `TcpListener::accept`
    pub fn new(stream: TcpStream, send_timeout: Duration) -> TransportResult<Self> {
        stream.set_nonblocking(false).map_err(io_error)?;
        stream.set_nodelay(true).map_err(io_error)?;
        stream.set_write_timeout(Some(send_timeout)).map_err(io_error)?;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn send(&self, buf: &[u8], max_len: ByteCount) -> TransportResult<ByteCount> {
        let len = buf.len().min(max_len);
        match (&self.stream).write(&buf[..len]) {
            Ok(count) => {
                #[cfg(debug_assertions)]
                debug!("TcpTransport Tx: Sent {count} of {len} bytes");
                Ok(count)
            }
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::OutOfMemory => Ok(0),
                ErrorKind::TimedOut => {
                    warn!("TcpTransport Tx: Timeout sending {len} bytes");
                    Ok(0)
                }
                _ => {
                    self.close();
                    Err(classify(e))
                }
            },
        }
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> TransportResult<ByteCount> {
        if timeout.is_zero() {
            return Err(TransportError::Io { msg: String::from("receive timeout must not be zero") });
        }
        self.stream.set_read_timeout(Some(timeout)).map_err(io_error)?;

        match (&self.stream).read(buf) {
            Ok(0) => {
                self.close();
                Err(TransportError::Closed)
            }
            Ok(count) => Ok(count),
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => Ok(0),
                _ => {
                    self.close();
                    Err(classify(e))
                }
            },
        }
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

#[derive(Default)]
pub struct TcpConnector {}

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: PortNumber,
        timeout: Duration,
        send_timeout: Duration,
    ) -> TransportResult<Arc<dyn Transport>> {
        if port == 0 {
            return Err(TransportError::Resolve { msg: format!("{host}:0, port must not be zero") });
        }

        let addresses = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve { msg: format!("{host}:{port}, {e}") })?;

        let mut last_error = TransportError::Resolve { msg: format!("{host}:{port}, no addresses") };
        for address in addresses {
            match TcpStream::connect_timeout(&address, timeout) {
                Ok(stream) => return Ok(Arc::new(TcpTransport::new(stream, send_timeout)?)),
                Err(e) => last_error = classify(e),
            }
        }
        Err(last_error)
    }
}

fn classify(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => io_error(e),
    }
}

fn io_error(e: std::io::Error) -> TransportError {
    TransportError::Io { msg: e.to_string() }
}
