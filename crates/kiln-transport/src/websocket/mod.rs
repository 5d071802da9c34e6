//! WebSocket support layered over the multiplexer.
//!
//! [`WebSocketLayer`] is a [`Handler`] that runs the HTTP upgrade
//! handshake, then decodes RFC 6455 frames and hands complete text
//! messages to an application [`WebSocketHandler`].

pub mod http;

use std::time::{Duration, Instant};

use kiln_protocol::websocket::{self, Message, MessageDecoder, OpCode, PING_FRAME};

use crate::{Connection, Handler, ServerHandle, TransportError};
use http::{HttpRequest, Rejection, find_header_end};

/// Largest request head accepted before the terminator is seen.
pub const MAX_HANDSHAKE_SIZE: usize = 64 * 1024;

/// Default interval between keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Handshake and keepalive settings.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Take the client address from `X-Forwarded-For` when present.
    pub trust_forwarded_for: bool,
    pub ping_interval: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_for: false,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Application callbacks for upgraded connections.
pub trait WebSocketHandler: Send + 'static {
    /// Per-connection data produced by a successful authorization.
    type Session: Send;

    /// Decides whether the upgrade may proceed. Returning `None` answers
    /// `401` and disconnects.
    fn authorize(&mut self, conn: &Connection, request: &HttpRequest) -> Option<Self::Session>;

    /// The `101` response has been sent.
    fn on_open(&mut self, _conn: &Connection, _session: &mut Self::Session) {}

    /// A complete text message arrived.
    fn on_text(&mut self, conn: &Connection, session: &mut Self::Session, text: String);

    /// The upgraded connection was reaped.
    fn on_close(&mut self, _conn: &Connection, _session: Self::Session) {}
}

enum Phase {
    Handshake(Vec<u8>),
    Open(MessageDecoder),
}

/// Per-connection state kept by [`WebSocketLayer`].
pub struct WebSocketState<S> {
    phase: Phase,
    session: Option<S>,
    last_ping: Instant,
}

/// Adapts a [`WebSocketHandler`] to the multiplexer.
pub struct WebSocketLayer<A> {
    app: A,
    config: WebSocketConfig,
}

impl<A: WebSocketHandler> WebSocketLayer<A> {
    pub fn new(app: A) -> Self {
        Self::with_config(app, WebSocketConfig::default())
    }

    pub fn with_config(app: A, config: WebSocketConfig) -> Self {
        Self { app, config }
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    fn reject(conn: &Connection, rejection: &Rejection) {
        tracing::warn!(
            conn_id = %conn.id(),
            status = rejection.status,
            reason = rejection.message,
            "websocket handshake rejected"
        );
        let _ = conn.send(&rejection.to_response());
        conn.disconnect(format!("handshake rejected: {}", rejection.message));
    }

    /// Runs the handshake once the head is complete. Returns any bytes
    /// that followed the head.
    fn handshake(
        &mut self,
        conn: &Connection,
        state: &mut WebSocketState<A::Session>,
    ) -> Option<Vec<u8>> {
        let Phase::Handshake(buffer) = &mut state.phase else {
            return None;
        };
        let Some((end, terminator)) = find_header_end(buffer) else {
            if buffer.len() > MAX_HANDSHAKE_SIZE {
                Self::reject(conn, &Rejection::new(431, "Request header too large."));
            }
            return None;
        };
        let rest = buffer.split_off(end + terminator);
        buffer.truncate(end);

        let request = match HttpRequest::parse(buffer) {
            Ok(request) => request,
            Err(rejection) => {
                Self::reject(conn, &rejection);
                return None;
            }
        };
        let key = match request.validate_upgrade() {
            Ok(key) => key,
            Err(rejection) => {
                Self::reject(conn, &rejection);
                return None;
            }
        };

        if self.config.trust_forwarded_for {
            if let Some(address) = request.forwarded_for() {
                conn.set_remote_address(address);
            }
        }

        let Some(mut session) = self.app.authorize(conn, &request) else {
            Self::reject(conn, &Rejection::new(401, "Unauthorized."));
            return None;
        };

        let protocol = request
            .header("sec-websocket-protocol")
            .and_then(|offered| offered.split(',').next())
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let response = http::switching_protocols(&websocket::accept_key(key), protocol);
        if conn.send(&response).is_err() {
            return None;
        }

        conn.mark_upgraded();
        tracing::debug!(
            conn_id = %conn.id(),
            remote = %conn.remote_address(),
            path = %request.path,
            "websocket upgraded"
        );
        state.phase = Phase::Open(MessageDecoder::new());
        self.app.on_open(conn, &mut session);
        state.session = Some(session);
        Some(rest)
    }

    fn frames(&mut self, conn: &Connection, state: &mut WebSocketState<A::Session>, data: &[u8]) {
        let (Phase::Open(decoder), Some(session)) = (&mut state.phase, &mut state.session) else {
            return;
        };
        if let Err(e) = decoder.feed(data) {
            tracing::warn!(conn_id = %conn.id(), error = %e, "websocket protocol violation");
            conn.disconnect(e.to_string());
            return;
        }
        while !conn.is_disconnected() {
            match decoder.next_message() {
                Ok(None) => break,
                Ok(Some(Message::Text(text))) => self.app.on_text(conn, session, text),
                Ok(Some(Message::Ping(payload))) => {
                    let _ = conn.send(&websocket::encode_frame(OpCode::Pong, &payload, None));
                }
                Ok(Some(Message::Pong)) => {}
                Ok(Some(Message::Binary(payload))) => {
                    tracing::debug!(conn_id = %conn.id(), len = payload.len(), "ignoring binary frame");
                }
                Ok(Some(Message::Close)) => {
                    let _ = conn.send(&websocket::encode_frame(OpCode::Close, &[], None));
                    conn.disconnect("websocket closed by peer");
                }
                Err(e) => {
                    tracing::warn!(conn_id = %conn.id(), error = %e, "websocket protocol violation");
                    conn.disconnect(e.to_string());
                }
            }
        }
    }
}

impl<A: WebSocketHandler> Handler for WebSocketLayer<A> {
    type State = WebSocketState<A::Session>;

    fn on_connected(&mut self, _conn: &Connection) -> Self::State {
        WebSocketState {
            phase: Phase::Handshake(Vec::new()),
            session: None,
            last_ping: Instant::now(),
        }
    }

    fn on_data(&mut self, conn: &Connection, state: &mut Self::State, data: &[u8]) {
        match &mut state.phase {
            Phase::Handshake(buffer) => {
                buffer.extend_from_slice(data);
                if let Some(rest) = self.handshake(conn, state) {
                    state.last_ping = Instant::now();
                    if !rest.is_empty() {
                        self.frames(conn, state, &rest);
                    }
                }
            }
            Phase::Open(_) => self.frames(conn, state, data),
        }
    }

    fn on_poll(&mut self, conn: &Connection, state: &mut Self::State, now: Instant) {
        if !matches!(state.phase, Phase::Open(_)) {
            return;
        }
        if now.duration_since(state.last_ping) >= self.config.ping_interval {
            state.last_ping = now;
            let _ = conn.send(&PING_FRAME);
        }
    }

    fn on_disconnected(&mut self, conn: &Connection, state: Self::State) {
        if let Some(session) = state.session {
            self.app.on_close(conn, session);
        }
    }
}

/// Sends one line-protocol or plain text message as a text frame.
pub fn send_text(conn: &Connection, text: &str) -> Result<(), TransportError> {
    conn.send(&websocket::encode_text(text))
}

/// Sends `text` to every upgraded connection behind `handle`.
pub fn broadcast_text(handle: &ServerHandle, text: &str) {
    let frame = websocket::encode_text(text);
    handle.broadcast_where(&frame, Connection::is_upgraded);
}
