//! Integration tests for the poll-driven multiplexer over real loopback
//! sockets. Each test drives a `Server` on a background thread the way the
//! service binary does.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kiln_transport::{Connection, Handler, Server, ServerHandle};

// =========================================================================
// Helpers
// =========================================================================

/// Runs `process()` in a loop until dropped.
struct Driver {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn drive<H: Handler>(mut server: Server<H>) -> (SocketAddr, ServerHandle, Driver) {
    let addr = server.local_addr();
    let handle = server.handle();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let thread = thread::spawn(move || {
        while !flag.load(Ordering::Acquire) {
            server.process();
            thread::sleep(Duration::from_millis(2));
        }
    });
    (
        addr,
        handle,
        Driver {
            stop,
            thread: Some(thread),
        },
    )
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("should connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("should set timeout");
    stream
}

/// Echoes every chunk back and counts lifecycle hooks.
#[derive(Default)]
struct Echo {
    connected: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
}

impl Handler for Echo {
    type State = usize;

    fn on_connected(&mut self, _conn: &Connection) -> usize {
        self.connected.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn on_data(&mut self, conn: &Connection, received: &mut usize, data: &[u8]) {
        *received += data.len();
        if data == b"quit" {
            conn.disconnect("asked to quit");
            return;
        }
        let _ = conn.send(data);
    }

    fn on_disconnected(&mut self, _conn: &Connection, _received: usize) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

// =========================================================================
// Tests
// =========================================================================

#[test]
fn test_echo_round_trip() {
    let server = Server::bind("127.0.0.1:0", Echo::default()).expect("should bind");
    let (addr, _handle, _driver) = drive(server);

    let mut client = connect(addr);
    client.write_all(b"hello").expect("should write");
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).expect("should read echo");
    assert_eq!(&buf, b"hello");
}

#[test]
fn test_broadcast_reaches_every_connection() {
    let echo = Echo::default();
    let connected = Arc::clone(&echo.connected);
    let server = Server::bind("127.0.0.1:0", echo).expect("should bind");
    let (addr, handle, _driver) = drive(server);

    let mut a = connect(addr);
    let mut b = connect(addr);
    wait_until("both accepts", || connected.load(Ordering::SeqCst) == 2);
    assert_eq!(handle.connection_count(), 2);

    handle.broadcast(b"news");
    for client in [&mut a, &mut b] {
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).expect("should receive broadcast");
        assert_eq!(&buf, b"news");
    }
}

#[test]
fn test_peer_close_is_reaped() {
    let echo = Echo::default();
    let connected = Arc::clone(&echo.connected);
    let disconnected = Arc::clone(&echo.disconnected);
    let server = Server::bind("127.0.0.1:0", echo).expect("should bind");
    let (addr, handle, _driver) = drive(server);

    let client = connect(addr);
    wait_until("accept", || connected.load(Ordering::SeqCst) == 1);
    drop(client);

    wait_until("reap", || disconnected.load(Ordering::SeqCst) == 1);
    assert_eq!(handle.connection_count(), 0);
}

#[test]
fn test_handler_disconnect_closes_socket() {
    let echo = Echo::default();
    let disconnected = Arc::clone(&echo.disconnected);
    let server = Server::bind("127.0.0.1:0", echo).expect("should bind");
    let (addr, _handle, _driver) = drive(server);

    let mut client = connect(addr);
    client.write_all(b"quit").expect("should write");
    wait_until("reap", || disconnected.load(Ordering::SeqCst) == 1);

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "server should have closed the socket");
}

#[test]
fn test_idle_connection_is_dropped() {
    let echo = Echo::default();
    let connected = Arc::clone(&echo.connected);
    let disconnected = Arc::clone(&echo.disconnected);
    let server = Server::bind("127.0.0.1:0", echo)
        .expect("should bind")
        .with_idle_timeout(Duration::from_millis(100));
    let (addr, _handle, _driver) = drive(server);

    let _client = connect(addr);
    wait_until("accept", || connected.load(Ordering::SeqCst) == 1);
    // The sweep runs about once a second.
    thread::sleep(Duration::from_millis(1200));
    wait_until("idle reap", || disconnected.load(Ordering::SeqCst) == 1);
}

#[test]
fn test_bind_conflict_reports_address() {
    let first = Server::bind("127.0.0.1:0", Echo::default()).expect("should bind");
    let addr = first.local_addr();
    let err = match Server::bind(addr.to_string(), Echo::default()) {
        Ok(_) => panic!("second bind on {addr} should fail"),
        Err(e) => e,
    };
    assert!(err.to_string().contains(&addr.to_string()));
}

#[test]
fn test_stalled_peer_does_not_hold_up_others() {
    let echo = Echo::default();
    let connected = Arc::clone(&echo.connected);
    let disconnected = Arc::clone(&echo.disconnected);
    let server = Server::bind("127.0.0.1:0", echo).expect("should bind");
    let (addr, handle, _driver) = drive(server);

    // Connects and never reads.
    let _stalled = connect(addr);
    wait_until("accept", || connected.load(Ordering::SeqCst) == 1);
    let stalled_id = handle.connections()[0].id();

    let payload = vec![0x5a; 64 * 1024 * 1024];
    let broadcaster = {
        let handle = handle.clone();
        thread::spawn(move || handle.broadcast_where(&payload, |conn| conn.id() == stalled_id))
    };

    let started = Instant::now();
    let mut healthy = connect(addr);
    healthy.write_all(b"ping").expect("should write");
    let mut buf = [0u8; 4];
    healthy.read_exact(&mut buf).expect("should read echo");
    assert_eq!(&buf, b"ping");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "echo took {:?}",
        started.elapsed()
    );

    broadcaster.join().expect("broadcast should not panic");
    wait_until("stalled peer reaped", || {
        disconnected.load(Ordering::SeqCst) == 1
    });
    assert_eq!(handle.connection_count(), 1);
}

#[test]
fn test_slow_reader_receives_queued_output() {
    let echo = Echo::default();
    let connected = Arc::clone(&echo.connected);
    let server = Server::bind("127.0.0.1:0", echo).expect("should bind");
    let (addr, handle, _driver) = drive(server);

    let mut client = connect(addr);
    wait_until("accept", || connected.load(Ordering::SeqCst) == 1);

    let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let started = Instant::now();
    handle.broadcast(&payload);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "broadcast should queue instead of waiting on the reader"
    );

    thread::sleep(Duration::from_millis(100));
    let mut received = vec![0u8; payload.len()];
    client
        .read_exact(&mut received)
        .expect("should read the whole broadcast");
    assert!(received == payload, "queued output should arrive intact");
    let conn = handle.connections()[0].clone();
    wait_until("queue drained", || conn.pending_bytes() == 0);
    assert!(!conn.is_disconnected());
}
