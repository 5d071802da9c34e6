//! A single accepted socket shared between the poll loop and broadcasters.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{ConnectionId, TransportError};

/// How long queued output may sit without the peer draining any of it.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Most bytes a connection may have queued before it is dropped.
pub const MAX_OUTBOUND: usize = 16 * 1024 * 1024;

/// Bytes the socket would not take yet.
#[derive(Default)]
struct Outbound {
    buf: Vec<u8>,
    stalled_since: Option<Instant>,
}

struct Inner {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    remote_address: Mutex<String>,
    outbound: Mutex<Outbound>,
    disconnect: Mutex<Option<String>>,
    flagged: AtomicBool,
    upgraded: AtomicBool,
}

/// Cheaply clonable handle to one live connection.
///
/// Reads happen only on the poll thread. Sends may come from any thread
/// and never block: whatever the socket will not take is queued and
/// drained by the poll loop. Disconnection is a flag: the socket stays
/// open until the next poll cycle reaps it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                stream,
                peer_addr,
                remote_address: Mutex::new(peer_addr.ip().to_string()),
                outbound: Mutex::new(Outbound::default()),
                disconnect: Mutex::new(None),
                flagged: AtomicBool::new(false),
                upgraded: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The socket's peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// The client address used for logging and authorization. Defaults to
    /// the peer IP; a trusted proxy header may override it.
    pub fn remote_address(&self) -> String {
        self.inner.remote_address.lock().clone()
    }

    pub fn set_remote_address(&self, address: impl Into<String>) {
        *self.inner.remote_address.lock() = address.into();
    }

    /// Marks the connection as having completed a protocol upgrade.
    pub fn mark_upgraded(&self) {
        self.inner.upgraded.store(true, Ordering::Release);
    }

    pub fn is_upgraded(&self) -> bool {
        self.inner.upgraded.load(Ordering::Acquire)
    }

    /// Flags the connection for disconnect. The first reason wins.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let mut slot = self.inner.disconnect.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
            self.inner.flagged.store(true, Ordering::Release);
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.flagged.load(Ordering::Acquire)
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.inner.disconnect.lock().clone()
    }

    /// Writes `data` or queues what the socket will not take yet. A write
    /// error or a queue past [`MAX_OUTBOUND`] flags the connection for
    /// disconnect.
    pub fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if let Some(reason) = self.disconnect_reason() {
            return Err(TransportError::ConnectionClosed(reason));
        }
        let mut outbound = self.inner.outbound.lock();
        let mut rest = data;
        if outbound.buf.is_empty() {
            match write_nonblocking(&self.inner.stream, rest) {
                Ok(n) => rest = &rest[n..],
                Err(e) => {
                    drop(outbound);
                    self.disconnect(format!("send failed: {e}"));
                    return Err(TransportError::SendFailed(e));
                }
            }
        }
        if rest.is_empty() {
            return Ok(());
        }
        if outbound.buf.len() + rest.len() > MAX_OUTBOUND {
            drop(outbound);
            self.disconnect("send queue full");
            return Err(TransportError::SendQueueFull(self.id()));
        }
        if outbound.buf.is_empty() {
            outbound.stalled_since = Some(Instant::now());
        }
        outbound.buf.extend_from_slice(rest);
        Ok(())
    }

    /// Bytes queued behind a full socket buffer.
    pub fn pending_bytes(&self) -> usize {
        self.inner.outbound.lock().buf.len()
    }

    /// Drains as much queued output as the socket takes. A peer that
    /// drains nothing for [`SEND_TIMEOUT`] is flagged for disconnect.
    pub(crate) fn flush(&self, now: Instant) {
        let mut outbound = self.inner.outbound.lock();
        if outbound.buf.is_empty() {
            return;
        }
        match write_nonblocking(&self.inner.stream, &outbound.buf) {
            Ok(0) => {
                let stalled = outbound
                    .stalled_since
                    .is_some_and(|since| now.saturating_duration_since(since) > SEND_TIMEOUT);
                if stalled {
                    drop(outbound);
                    self.disconnect("send timed out");
                }
            }
            Ok(n) => {
                outbound.buf.drain(..n);
                outbound.stalled_since = (!outbound.buf.is_empty()).then_some(now);
            }
            Err(e) => {
                outbound.buf.clear();
                drop(outbound);
                self.disconnect(format!("send failed: {e}"));
            }
        }
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner.stream).read(buf)
    }

    pub(crate) fn close_socket(&self) {
        let _ = self.inner.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Writes until the socket would block. Returns the bytes written.
fn write_nonblocking(mut stream: &TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
