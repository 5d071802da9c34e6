//! Control-panel side of the binary protocol.
//!
//! [`HostClient`] owns a worker thread that keeps one connection to the
//! host service alive:
//!
//! ```text
//! idle ──connect()──▶ connecting ──ok──▶ connected ──error──▶ wait 5s ──▶ connecting
//!                          └──failed──▶ wait 30s ──▶ connecting
//! ```
//!
//! Outbound frames are queued and flushed by the worker. Replies to
//! requests made through [`HostClient::request`] are handed to the waiting
//! caller; everything else goes to [`ClientEvents`].

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use kiln_protocol::{
    ByteBuffer, Frame, FrameBuilder, FrameDecoder, Header, InstanceConfiguration, InstanceStatus,
    InstanceSummary, NO_REQUEST_ID, ProtocolError,
};
use kiln_transport::TransportError;
use parking_lot::Mutex;

use crate::KilnError;
use crate::correlation::{DEFAULT_REQUEST_TIMEOUT, PendingRequests, RequestError, Ticket};

/// Wait before retrying after a failed connect.
pub const CONNECT_RETRY: Duration = Duration::from_secs(30);

/// Wait before reconnecting after an established connection failed.
pub const DROP_RETRY: Duration = Duration::from_secs(5);

/// Interval between keepalive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(120);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_WAIT: Duration = Duration::from_millis(100);
const SESSION_WAIT: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unsolicited frames and connection changes. Called on the worker
/// thread.
#[allow(unused_variables)]
pub trait ClientEvents: Send + Sync + 'static {
    fn on_connected(&self, addr: SocketAddr) {}

    fn on_connection_failed(&self, addr: SocketAddr, error: &io::Error) {}

    fn on_disconnected(&self, reason: &str) {}

    fn on_new_instance(&self, request_id: i32, instance_id: &str, package_name: &str) {}

    fn on_instance_status(&self, request_id: i32, instance_id: &str, status: InstanceStatus) {}

    fn on_instance_log(&self, request_id: i32, instance_id: &str, text: &str) {}

    fn on_instance_configuration(
        &self,
        request_id: i32,
        instance_id: &str,
        configuration: &InstanceConfiguration,
    ) {
    }

    fn on_instance_list(&self, request_id: i32, instances: &[InstanceSummary]) {}

    fn on_service_error(&self, request_id: i32, message: &str) {}
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl ClientEvents for NoEvents {}

/// Why the connected loop ended and how long to wait before the next
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoopExit {
    retry_after: Duration,
}

impl LoopExit {
    fn connect_failed() -> Self {
        Self {
            retry_after: CONNECT_RETRY,
        }
    }

    fn dropped() -> Self {
        Self {
            retry_after: DROP_RETRY,
        }
    }
}

/// An encoded frame waiting for the connection.
struct Outgoing {
    request_id: i32,
    bytes: Vec<u8>,
}

struct Shared {
    pending: PendingRequests,
    outbound: Mutex<Vec<Outgoing>>,
    send_signal: Sender<()>,
    connected: AtomicBool,
    events: Arc<dyn ClientEvents>,
}

impl Shared {
    fn queue(&self, request_id: i32, bytes: Vec<u8>) {
        self.outbound.lock().push(Outgoing { request_id, bytes });
        let _ = self.send_signal.try_send(());
    }

    /// Drops a still-queued request nobody waits for any more.
    fn withdraw(&self, request_id: i32) {
        if request_id != NO_REQUEST_ID {
            self.outbound.lock().retain(|out| out.request_id != request_id);
        }
    }
}

/// A reconnecting client for the host service.
pub struct HostClient {
    shared: Arc<Shared>,
    connect: Sender<SocketAddr>,
    shutdown: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl HostClient {
    /// Starts the worker. Nothing connects until [`connect`](Self::connect).
    pub fn new(events: impl ClientEvents) -> Self {
        let (send_signal, send_rx) = channel::bounded(1);
        let (connect, connect_rx) = channel::unbounded();
        let (shutdown, shutdown_rx) = channel::bounded(1);
        let shared = Arc::new(Shared {
            pending: PendingRequests::new(),
            outbound: Mutex::new(Vec::new()),
            send_signal,
            connected: AtomicBool::new(false),
            events: Arc::new(events),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            connect_rx,
            shutdown_rx,
            send_rx,
        };
        let worker = thread::Builder::new()
            .name("kiln-client".into())
            .spawn(move || worker.run())
            .ok();
        if worker.is_none() {
            tracing::error!("could not start client worker thread");
        }

        Self {
            shared,
            connect,
            shutdown,
            worker,
        }
    }

    /// Connects to `addr`. A new address takes effect once the current
    /// connection, if any, ends.
    pub fn connect(&self, addr: SocketAddr) {
        let _ = self.connect.send(addr);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Queues an encoded frame. Frames queued while disconnected are sent
    /// once a connection is up.
    pub fn send(&self, frame: &Frame) -> Result<(), KilnError> {
        self.shared.queue(frame.request_id, frame.encode()?);
        Ok(())
    }

    /// Sends a frame under a fresh request id without waiting.
    pub fn begin(&self, header: Header, payload: Vec<u8>) -> Result<Ticket, KilnError> {
        let ticket = self.shared.pending.register();
        match Frame::new(header, ticket.id(), payload).encode() {
            Ok(bytes) => {
                self.shared.queue(ticket.id(), bytes);
                Ok(ticket)
            }
            Err(e) => {
                self.shared.pending.cancel(ticket.id());
                Err(e.into())
            }
        }
    }

    /// Waits for the reply to a request started with [`begin`](Self::begin).
    pub fn wait(&self, ticket: Ticket, timeout: Duration) -> Result<Frame, RequestError> {
        let id = ticket.id();
        let result = self.shared.pending.wait(ticket, timeout);
        if result.is_err() {
            self.shared.withdraw(id);
        }
        result
    }

    /// Sends a request and blocks for its reply.
    pub fn request(&self, header: Header, payload: Vec<u8>, timeout: Duration) -> Result<Frame, KilnError> {
        let ticket = self.begin(header, payload)?;
        Ok(self.wait(ticket, timeout)?)
    }

    /// Gives up on one request; its waiter gets [`RequestError::Cancelled`].
    pub fn cancel(&self, request_id: i32) -> bool {
        self.shared.withdraw(request_id);
        self.shared.pending.cancel(request_id)
    }

    /// Creates and starts an instance. Returns its id and package name.
    pub fn new_instance(
        &self,
        package_name: &str,
        configuration: &InstanceConfiguration,
    ) -> Result<(String, String), KilnError> {
        let mut payload = ByteBuffer::new();
        payload.write_str(package_name)?;
        configuration.write_to(&mut payload)?;

        let mut reply = expect(
            self.request(Header::New, payload.into_vec(), DEFAULT_REQUEST_TIMEOUT)?,
            Header::New,
        )?;
        Ok((reply.read_string()?, reply.read_string()?))
    }

    pub fn list(&self) -> Result<Vec<InstanceSummary>, KilnError> {
        let mut reply = expect(
            self.request(Header::List, Vec::new(), DEFAULT_REQUEST_TIMEOUT)?,
            Header::List,
        )?;
        read_list(&mut reply)
    }

    pub fn instance_configuration(&self, instance_id: &str) -> Result<InstanceConfiguration, KilnError> {
        let mut payload = ByteBuffer::new();
        payload.write_str(instance_id)?;

        let mut reply = expect(
            self.request(Header::InstanceConfiguration, payload.into_vec(), DEFAULT_REQUEST_TIMEOUT)?,
            Header::InstanceConfiguration,
        )?;
        let _id = reply.read_string()?;
        Ok(InstanceConfiguration::read_from(&mut reply)?)
    }

    /// Posts a console command. The service only answers on failure, so
    /// a refusal arrives as [`ClientEvents::on_service_error`].
    pub fn command(&self, instance_id: &str, command: &str) -> Result<(), KilnError> {
        let mut frame = FrameBuilder::new(Header::Command, NO_REQUEST_ID)?;
        frame.write_str(instance_id)?.write_str(command)?;
        self.shared.queue(NO_REQUEST_ID, frame.finish()?);
        Ok(())
    }

    /// Kills an instance's process. Refusals arrive like [`command`](Self::command)'s.
    pub fn terminate(&self, instance_id: &str) -> Result<(), KilnError> {
        let mut frame = FrameBuilder::new(Header::Terminate, NO_REQUEST_ID)?;
        frame.write_str(instance_id)?;
        self.shared.queue(NO_REQUEST_ID, frame.finish()?);
        Ok(())
    }

    /// Stops the worker and cancels every pending request.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown.try_send(());
        self.shared.pending.cancel_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for HostClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Unwraps a reply of the expected kind. An `Error` reply becomes
/// [`RequestError::Service`].
fn expect(frame: Frame, header: Header) -> Result<ByteBuffer, KilnError> {
    if frame.header == header {
        return Ok(frame.reader());
    }
    if frame.header == Header::Error {
        let message = frame.reader().read_string()?;
        return Err(RequestError::Service(message).into());
    }
    Err(RequestError::UnexpectedReply(frame.header).into())
}

fn read_list(reader: &mut ByteBuffer) -> Result<Vec<InstanceSummary>, KilnError> {
    let count = reader.read_i32()?;
    let count = usize::try_from(count).map_err(|_| ProtocolError::InvalidLength(count))?;
    let mut instances = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        instances.push(InstanceSummary::read_from(reader)?);
    }
    Ok(instances)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum Wake {
    Connect(SocketAddr),
    Send,
    Shutdown,
    Timeout,
}

struct Worker {
    shared: Arc<Shared>,
    connect_rx: Receiver<SocketAddr>,
    shutdown_rx: Receiver<()>,
    send_rx: Receiver<()>,
}

impl Worker {
    fn run(self) {
        let mut target: Option<SocketAddr> = None;
        let mut retry_at: Option<Instant> = None;

        loop {
            let wake = select! {
                recv(self.connect_rx) -> addr => match addr {
                    Ok(addr) => Wake::Connect(addr),
                    Err(_) => Wake::Shutdown,
                },
                recv(self.shutdown_rx) -> _ => Wake::Shutdown,
                default(IDLE_WAIT) => Wake::Timeout,
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Connect(addr) => target = Some(addr),
                Wake::Timeout | Wake::Send => {
                    if !retry_at.is_some_and(|at| Instant::now() >= at) {
                        continue;
                    }
                }
            }
            let Some(addr) = target else {
                continue;
            };
            retry_at = None;

            match self.session(addr) {
                Ok(()) => break,
                Err(exit) => {
                    tracing::debug!(%addr, retry_after = ?exit.retry_after, "client loop exited");
                    retry_at = Some(Instant::now() + exit.retry_after);
                }
            }
        }
        tracing::debug!("client worker stopped");
    }

    /// Runs one connection. `Ok` means shutdown was requested.
    fn session(&self, addr: SocketAddr) -> Result<(), LoopExit> {
        tracing::info!(%addr, "connecting to host service");
        let mut stream = match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "connection failed");
                self.shared.events.on_connection_failed(addr, &e);
                return Err(LoopExit::connect_failed());
            }
        };
        if let Err(e) = configure(&stream) {
            tracing::warn!(%addr, error = %e, "could not configure socket");
            return Err(LoopExit::dropped());
        }

        self.shared.connected.store(true, Ordering::Release);
        self.shared.events.on_connected(addr);
        tracing::info!(%addr, "connected to host service");

        let result = self.pump(&mut stream);

        self.shared.connected.store(false, Ordering::Release);
        let reason = match &result {
            Ok(()) => "shutdown".to_string(),
            Err(e) => e.to_string(),
        };
        self.shared.events.on_disconnected(&reason);
        tracing::info!(%addr, %reason, "disconnected from host service");

        result.map_err(|_| LoopExit::dropped())
    }

    fn pump(&self, stream: &mut TcpStream) -> Result<(), KilnError> {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut next_ping = Instant::now() + PING_INTERVAL;

        self.flush(stream)?;
        loop {
            let wake = select! {
                recv(self.send_rx) -> _ => Wake::Send,
                recv(self.shutdown_rx) -> _ => Wake::Shutdown,
                default(SESSION_WAIT) => Wake::Timeout,
            };
            match wake {
                Wake::Shutdown => return Ok(()),
                Wake::Send => self.flush(stream)?,
                Wake::Connect(_) | Wake::Timeout => {}
            }

            let now = Instant::now();
            if now >= next_ping {
                self.shared
                    .queue(NO_REQUEST_ID, Frame::empty(Header::Ping, NO_REQUEST_ID).encode()?);
                next_ping = now + PING_INTERVAL;
            }

            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        return Err(TransportError::ConnectionClosed(
                            "closed by host".into(),
                        )
                        .into());
                    }
                    Ok(n) => {
                        decoder.feed(&buf[..n])?;
                        while let Some(frame) = decoder.next_frame()? {
                            self.deliver(frame)?;
                        }
                    }
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(TransportError::ReceiveFailed(e).into()),
                }
            }
        }
    }

    fn flush(&self, stream: &mut TcpStream) -> Result<(), KilnError> {
        let pending = std::mem::take(&mut *self.shared.outbound.lock());
        for out in &pending {
            stream
                .write_all(&out.bytes)
                .map_err(TransportError::SendFailed)?;
        }
        Ok(())
    }

    /// Completes a pending request or raises the matching event.
    fn deliver(&self, frame: Frame) -> Result<(), KilnError> {
        let frame = match self.shared.pending.complete(frame) {
            Ok(()) => return Ok(()),
            Err(frame) => frame,
        };
        let events = &self.shared.events;
        let request_id = frame.request_id;
        let mut reader = frame.reader();
        match frame.header {
            Header::Ping => {}
            Header::New => {
                let instance_id = reader.read_string()?;
                let package_name = reader.read_string()?;
                events.on_new_instance(request_id, &instance_id, &package_name);
            }
            Header::InstanceStatus => {
                let instance_id = reader.read_string()?;
                let status = InstanceStatus::try_from(reader.read_i32()?)?;
                events.on_instance_status(request_id, &instance_id, status);
            }
            Header::InstanceLog => {
                let instance_id = reader.read_string()?;
                let text = reader.read_string()?;
                events.on_instance_log(request_id, &instance_id, &text);
            }
            Header::InstanceConfiguration => {
                let instance_id = reader.read_string()?;
                let configuration = InstanceConfiguration::read_from(&mut reader)?;
                events.on_instance_configuration(request_id, &instance_id, &configuration);
            }
            Header::List => {
                let instances = read_list(&mut reader)?;
                events.on_instance_list(request_id, &instances);
            }
            Header::Error => {
                let message = reader.read_string()?;
                events.on_service_error(request_id, &message);
            }
            Header::Command | Header::Terminate => {
                tracing::warn!(header = %frame.header, "unexpected request frame from host");
            }
        }
        Ok(())
    }
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays() {
        assert_eq!(LoopExit::connect_failed().retry_after, Duration::from_secs(30));
        assert_eq!(LoopExit::dropped().retry_after, Duration::from_secs(5));
    }

    #[test]
    fn test_expect_maps_error_reply() {
        let mut builder = FrameBuilder::new(Header::Error, 3).unwrap();
        builder.write_str("Instance not found.").unwrap();
        let bytes = builder.finish().unwrap();
        let frame = Frame::new(Header::Error, 3, bytes[kiln_protocol::HEADER_SIZE..].to_vec());

        match expect(frame, Header::InstanceConfiguration) {
            Err(KilnError::Request(RequestError::Service(message))) => {
                assert_eq!(message, "Instance not found.");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            expect(Frame::empty(Header::List, 3), Header::New),
            Err(KilnError::Request(RequestError::UnexpectedReply(Header::List)))
        ));
    }

    #[test]
    fn test_request_times_out_while_disconnected() {
        let client = HostClient::new(NoEvents);
        assert!(!client.is_connected());
        let err = client
            .request(Header::List, Vec::new(), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, KilnError::Request(RequestError::Timeout)));
        assert!(client.shared.outbound.lock().is_empty(), "timed-out frame should not be sent later");
    }

    #[test]
    fn test_cancel_withdraws_queued_frame() {
        let client = HostClient::new(NoEvents);
        client
            .send(&Frame::empty(Header::Ping, NO_REQUEST_ID))
            .unwrap();
        let ticket = client.begin(Header::List, Vec::new()).unwrap();
        assert_eq!(client.shared.outbound.lock().len(), 2);

        assert!(client.cancel(ticket.id()));
        let queued: Vec<i32> = client
            .shared
            .outbound
            .lock()
            .iter()
            .map(|out| out.request_id)
            .collect();
        assert_eq!(queued, [NO_REQUEST_ID]);
        assert_eq!(
            client.wait(ticket, Duration::from_secs(1)).unwrap_err(),
            RequestError::Cancelled
        );
    }
}
