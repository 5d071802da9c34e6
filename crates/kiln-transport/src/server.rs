//! The connection multiplexer.
//!
//! One [`Server`] wraps one listening socket. An external driver calls
//! [`Server::process`] in a loop; every call:
//!
//! 1. accepts pending connections (non-blocking) and fires `on_connected`;
//! 2. drains queued output, reads whatever each live connection has
//!    buffered and fires `on_data`; a zero-byte read or an error flags a
//!    disconnect;
//! 3. runs the idle sweep (at most once a second);
//! 4. reaps flagged connections and fires `on_disconnected`.
//!
//! All reads for a server happen on the driver thread. The only shared
//! structure is the connection registry used by [`ServerHandle::broadcast`].

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{Connection, ConnectionId, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Default inactivity window before a silent peer is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 64 * 1024;
/// Reads per connection per cycle, so one busy peer cannot starve others.
const MAX_READS_PER_CYCLE: usize = 16;

/// Per-protocol behaviour plugged into a [`Server`].
///
/// `State` is whatever the protocol keeps per connection: an inbound
/// decoder, an upgrade flag, an authenticated identity.
pub trait Handler: Send + 'static {
    type State: Send;

    /// A connection was accepted.
    fn on_connected(&mut self, conn: &Connection) -> Self::State;

    /// Raw bytes arrived. Protocol errors should call
    /// [`Connection::disconnect`]; they must never panic.
    fn on_data(&mut self, conn: &Connection, state: &mut Self::State, data: &[u8]);

    /// Called once per cycle for every live connection.
    fn on_poll(&mut self, _conn: &Connection, _state: &mut Self::State, _now: Instant) {}

    /// The connection was reaped.
    fn on_disconnected(&mut self, conn: &Connection, state: Self::State);
}

struct Slot<S> {
    conn: Connection,
    state: S,
    last_activity: Instant,
}

/// Clonable handle for sending to a server's connections from any thread.
#[derive(Clone, Default)]
pub struct ServerHandle {
    registry: Arc<Mutex<Vec<Connection>>>,
}

impl ServerHandle {
    /// Best-effort send to every live connection. Failures flag the
    /// failing connection instead of returning an error. Sends happen on
    /// a snapshot, outside the registry lock.
    pub fn broadcast(&self, data: &[u8]) {
        self.broadcast_where(data, |_| true);
    }

    /// Like [`broadcast`](Self::broadcast) but only to connections
    /// matching `filter`.
    pub fn broadcast_where(&self, data: &[u8], filter: impl Fn(&Connection) -> bool) {
        for conn in self.connections() {
            if conn.is_disconnected() || !filter(&conn) {
                continue;
            }
            if let Err(e) = conn.send(data) {
                tracing::debug!(conn_id = %conn.id(), error = %e, "broadcast send failed");
            }
        }
    }

    /// A snapshot of the live connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.registry.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }
}

/// A non-blocking, single-thread-driven socket server.
pub struct Server<H: Handler> {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: H,
    slots: Vec<Slot<H::State>>,
    handle: ServerHandle,
    idle_timeout: Duration,
    last_sweep: Instant,
    read_buf: Vec<u8>,
}

impl<H: Handler> Server<H> {
    /// Binds the listening socket and switches it to non-blocking mode.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Display, handler: H) -> Result<Self, TransportError> {
        let bind_err = |source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(&addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        tracing::info!(addr = %local_addr, "listening");

        Ok(Self {
            listener,
            local_addr,
            handler,
            slots: Vec::new(),
            handle: ServerHandle::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            last_sweep: Instant::now(),
            read_buf: vec![0; READ_CHUNK],
        })
    }

    /// Sets the inactivity window after which a silent peer is dropped.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn connection_count(&self) -> usize {
        self.slots.len()
    }

    /// Runs one accept/read/sweep/reap cycle.
    pub fn process(&mut self) {
        let now = Instant::now();
        self.accept_pending(now);
        self.read_all(now);
        if now.duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            self.last_sweep = now;
            self.sweep_idle(now);
        }
        self.reap();
    }

    /// Flags every connection and reaps them.
    pub fn shutdown(&mut self) {
        for slot in &self.slots {
            slot.conn.disconnect("server shutting down");
        }
        self.reap();
    }

    fn accept_pending(&mut self, now: Instant) {
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                tracing::warn!(%peer_addr, error = %e, "could not configure socket");
                continue;
            }
            let _ = stream.set_nodelay(true);

            let id = ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
            let conn = Connection::new(id, stream, peer_addr);
            tracing::debug!(conn_id = %id, %peer_addr, "accepted connection");

            self.handle.registry.lock().push(conn.clone());
            let state = self.handler.on_connected(&conn);
            self.slots.push(Slot {
                conn,
                state,
                last_activity: now,
            });
        }
    }

    fn read_all(&mut self, now: Instant) {
        for slot in &mut self.slots {
            slot.conn.flush(now);
            for _ in 0..MAX_READS_PER_CYCLE {
                if slot.conn.is_disconnected() {
                    break;
                }
                match slot.conn.read(&mut self.read_buf) {
                    Ok(0) => {
                        slot.conn.disconnect("connection closed by peer");
                    }
                    Ok(n) => {
                        slot.last_activity = now;
                        self.handler
                            .on_data(&slot.conn, &mut slot.state, &self.read_buf[..n]);
                        if n < self.read_buf.len() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        slot.conn.disconnect(format!("receive failed: {e}"));
                    }
                }
            }
            if !slot.conn.is_disconnected() {
                self.handler.on_poll(&slot.conn, &mut slot.state, now);
            }
        }
    }

    fn sweep_idle(&mut self, now: Instant) {
        for slot in &self.slots {
            if now.duration_since(slot.last_activity) > self.idle_timeout {
                slot.conn.disconnect("idle timeout");
            }
        }
    }

    fn reap(&mut self) {
        if !self.slots.iter().any(|s| s.conn.is_disconnected()) {
            return;
        }

        let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.slots)
            .into_iter()
            .partition(|s| s.conn.is_disconnected());
        self.slots = live;

        self.handle
            .registry
            .lock()
            .retain(|conn| !conn.is_disconnected());

        let now = Instant::now();
        for slot in dead {
            slot.conn.flush(now);
            let reason = slot.conn.disconnect_reason().unwrap_or_default();
            tracing::debug!(conn_id = %slot.conn.id(), %reason, "connection reaped");
            self.handler.on_disconnected(&slot.conn, slot.state);
            slot.conn.close_socket();
        }
    }
}

impl<H: Handler> Drop for Server<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
