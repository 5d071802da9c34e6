//! Browser console over WebSocket.
//!
//! Messages are `"<header> <escaped-json>|"` lines (see
//! [`kiln_protocol::line`]). The browser sends `new`, `cmd`, `stp` and
//! `trm`; the service pushes `lst` on open, `new`, `is`, `il` and `err`.
//! Every request needs at least [`AccountRole::Operator`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use kiln_instance::{Instance, InstanceError, InstanceManager, PackageCatalog};
use kiln_protocol::line::{self, LineMessage, LineSplitter};
use kiln_protocol::{Codec, InstanceConfiguration, InstanceStatus, JsonCodec, ProtocolError};
use kiln_transport::websocket::{self, http::HttpRequest};
use kiln_transport::{Connection, ServerHandle, WebSocketHandler};
use serde::{Deserialize, Serialize};

use crate::auth::{AccountRole, Authorizer, SESSION_COOKIE, User};

/// Console lines sent per instance in the `lst` greeting.
pub const LIST_LOG_LINES: usize = 200;

pub const PACKAGE_NOT_FOUND: &str = "Package was not found.";
pub const COMMAND_FAILED: &str = "Could not post command.";
pub const SHUTDOWN_FAILED: &str = "Could not send shutdown command.";
pub const TERMINATE_FAILED: &str = "Could not terminate process.";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPush<'a> {
    instance_id: &'a str,
    status: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogPush<'a> {
    instance_id: &'a str,
    text: String,
}

#[derive(Serialize)]
struct ErrorPush<'a> {
    message: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewPush<'a> {
    instance_id: &'a str,
    package_name: &'a str,
    status: i32,
    address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListEntry {
    instance_id: String,
    package_name: String,
    status: i32,
    address: String,
    last_log: Vec<String>,
}

#[derive(Serialize)]
struct ListPush {
    instances: Vec<ListEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewRequest {
    package_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest {
    instance_id: String,
    command: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRequest {
    instance_id: String,
}

/// `HH:MM:SS` in UTC.
pub fn clock_time(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

fn stamped(time: SystemTime, text: &str) -> String {
    format!("[{}] {}", clock_time(time), text)
}

/// The `is` push.
pub fn status_line(instance_id: &str, status: InstanceStatus) -> Result<String, ProtocolError> {
    line::encode_message(
        &JsonCodec,
        "is",
        &StatusPush {
            instance_id,
            status: status.as_i32(),
        },
    )
}

/// The `il` push; the text is prefixed with its time.
pub fn log_line(instance_id: &str, time: SystemTime, text: &str) -> Result<String, ProtocolError> {
    line::encode_message(
        &JsonCodec,
        "il",
        &LogPush {
            instance_id,
            text: stamped(time, text),
        },
    )
}

pub fn error_line(message: &str) -> Result<String, ProtocolError> {
    line::encode_message(&JsonCodec, "err", &ErrorPush { message })
}

// ---------------------------------------------------------------------------
// WebService
// ---------------------------------------------------------------------------

/// Per-connection state: who is connected and any unterminated text.
pub struct WebSession {
    pub user: User,
    splitter: LineSplitter,
}

type Route = fn(&WebService, &Connection, &WebSession, &str) -> Result<(), ProtocolError>;

struct RouteEntry {
    min_role: AccountRole,
    handler: Route,
}

/// The browser-facing [`WebSocketHandler`].
pub struct WebService {
    manager: Arc<InstanceManager>,
    catalog: Arc<dyn PackageCatalog>,
    authorizer: Arc<dyn Authorizer>,
    peers: ServerHandle,
    public_hostname: String,
    default_configuration: InstanceConfiguration,
    routes: HashMap<&'static str, RouteEntry>,
    codec: JsonCodec,
}

impl WebService {
    pub fn new(
        manager: Arc<InstanceManager>,
        catalog: Arc<dyn PackageCatalog>,
        authorizer: Arc<dyn Authorizer>,
        public_hostname: impl Into<String>,
        default_configuration: InstanceConfiguration,
    ) -> Self {
        let mut service = Self {
            manager,
            catalog,
            authorizer,
            peers: ServerHandle::default(),
            public_hostname: public_hostname.into(),
            default_configuration,
            routes: HashMap::new(),
            codec: JsonCodec,
        };
        service
            .route("new", AccountRole::Operator, Self::on_new_instance)
            .route("cmd", AccountRole::Operator, Self::on_command)
            .route("stp", AccountRole::Operator, Self::on_shutdown)
            .route("trm", AccountRole::Operator, Self::on_terminate);
        service
    }

    /// Binds a request header to a handler.
    pub fn route(&mut self, header: &'static str, min_role: AccountRole, handler: Route) -> &mut Self {
        self.routes.insert(header, RouteEntry { min_role, handler });
        self
    }

    /// Sets the handle used for pushes to every peer. Must be the handle
    /// of the server this service runs in.
    pub fn set_peers(&mut self, peers: ServerHandle) {
        self.peers = peers;
    }

    fn address(&self, instance: &Instance) -> String {
        format!("{}:{}", self.public_hostname, instance.binding().port)
    }

    fn send(&self, conn: &Connection, header: &str, value: &impl Serialize) -> Result<(), ProtocolError> {
        let text = line::encode_message(&self.codec, header, value)?;
        let _ = websocket::send_text(conn, &text);
        Ok(())
    }

    fn send_error(&self, conn: &Connection, message: &str) -> Result<(), ProtocolError> {
        let _ = websocket::send_text(conn, &error_line(message)?);
        Ok(())
    }

    fn send_list(&self, conn: &Connection) -> Result<(), ProtocolError> {
        let instances = self
            .manager
            .instances()
            .iter()
            .map(|instance| ListEntry {
                instance_id: instance.id().to_string(),
                package_name: instance.package().name.clone(),
                status: instance.status().as_i32(),
                address: self.address(instance),
                last_log: instance
                    .last_log(LIST_LOG_LINES)
                    .iter()
                    .map(|entry| stamped(entry.time, &entry.text))
                    .collect(),
            })
            .collect();
        self.send(conn, "lst", &ListPush { instances })
    }

    fn process(&self, conn: &Connection, session: &WebSession, message: LineMessage) {
        let Some(route) = self.routes.get(message.header.as_str()) else {
            tracing::warn!(conn_id = %conn.id(), header = %message.header, "unknown browser header");
            return;
        };
        if session.user.role < route.min_role {
            tracing::warn!(
                conn_id = %conn.id(),
                user = %session.user.name,
                header = %message.header,
                "insufficient privileges"
            );
            return;
        }
        if let Err(e) = (route.handler)(self, conn, session, &message.payload) {
            tracing::warn!(conn_id = %conn.id(), header = %message.header, error = %e, "browser request dropped");
        }
    }

    fn on_new_instance(&self, conn: &Connection, session: &WebSession, payload: &str) -> Result<(), ProtocolError> {
        let request: NewRequest = self.codec.decode(payload)?;
        tracing::info!(user = %session.user.name, package = %request.package_name, "browser requested instance");

        let Some(package) = self.catalog.find(&request.package_name) else {
            return self.send_error(conn, PACKAGE_NOT_FOUND);
        };
        let instance = match self
            .manager
            .create_and_start(package, self.default_configuration.clone())
        {
            Ok(instance) => instance,
            Err(InstanceError::NoBindingAvailable) => {
                return self.send_error(conn, &InstanceError::CapacityExceeded.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "instance refused");
                return self.send_error(conn, &e.to_string());
            }
        };

        let text = line::encode_message(
            &self.codec,
            "new",
            &NewPush {
                instance_id: instance.id(),
                package_name: &instance.package().name,
                status: instance.status().as_i32(),
                address: self.address(&instance),
            },
        )?;
        websocket::broadcast_text(&self.peers, &text);
        Ok(())
    }

    fn on_command(&self, conn: &Connection, session: &WebSession, payload: &str) -> Result<(), ProtocolError> {
        let request: CommandRequest = self.codec.decode(payload)?;

        if !self.manager.post_command(&request.instance_id, &request.command) {
            tracing::warn!(instance_id = %request.instance_id, "could not post command");
            return self.send_error(conn, COMMAND_FAILED);
        }

        let echoed = format!("{}> {}", session.user.name, request.command);
        tracing::info!(instance_id = %request.instance_id, "{echoed}");
        self.manager.append_log(&request.instance_id, &echoed);
        let text = log_line(&request.instance_id, SystemTime::now(), &echoed)?;
        websocket::broadcast_text(&self.peers, &text);
        Ok(())
    }

    fn on_shutdown(&self, conn: &Connection, session: &WebSession, payload: &str) -> Result<(), ProtocolError> {
        let request: InstanceRequest = self.codec.decode(payload)?;
        if !self.manager.post_shutdown(&request.instance_id) {
            tracing::error!(instance_id = %request.instance_id, user = %session.user.name, "shutdown failed");
            return self.send_error(conn, SHUTDOWN_FAILED);
        }
        Ok(())
    }

    fn on_terminate(&self, conn: &Connection, session: &WebSession, payload: &str) -> Result<(), ProtocolError> {
        let request: InstanceRequest = self.codec.decode(payload)?;
        if !self.manager.terminate(&request.instance_id) {
            tracing::error!(instance_id = %request.instance_id, user = %session.user.name, "terminate failed");
            return self.send_error(conn, TERMINATE_FAILED);
        }
        Ok(())
    }
}

impl WebSocketHandler for WebService {
    type Session = WebSession;

    fn authorize(&mut self, conn: &Connection, request: &HttpRequest) -> Option<WebSession> {
        let Some(token) = request.cookie(SESSION_COOKIE) else {
            tracing::warn!(conn_id = %conn.id(), "session cookie missing");
            return None;
        };
        let Some(user) = self.authorizer.authorize(token) else {
            tracing::warn!(conn_id = %conn.id(), remote = %conn.remote_address(), "session not recognized");
            return None;
        };
        tracing::info!(
            conn_id = %conn.id(),
            remote = %conn.remote_address(),
            user = %user.name,
            "browser session authorized"
        );
        Some(WebSession {
            user,
            splitter: LineSplitter::new(),
        })
    }

    fn on_open(&mut self, conn: &Connection, _session: &mut WebSession) {
        if let Err(e) = self.send_list(conn) {
            tracing::error!(conn_id = %conn.id(), error = %e, "could not encode instance list");
        }
    }

    fn on_text(&mut self, conn: &Connection, session: &mut WebSession, text: String) {
        let messages = match session.splitter.push(&text) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(conn_id = %conn.id(), error = %e, "browser buffer overflow");
                conn.disconnect(e.to_string());
                return;
            }
        };
        for message in messages {
            self.process(conn, session, message);
        }
    }

    fn on_close(&mut self, conn: &Connection, session: WebSession) {
        tracing::info!(conn_id = %conn.id(), user = %session.user.name, "browser session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_clock_time_is_utc() {
        let time = UNIX_EPOCH + Duration::from_secs(2 * 86_400 + 13 * 3600 + 5 * 60 + 9);
        assert_eq!(clock_time(time), "13:05:09");
        assert_eq!(clock_time(UNIX_EPOCH), "00:00:00");
    }

    #[test]
    fn test_status_line() {
        let line = status_line("0123456789abcdef", InstanceStatus::Running).unwrap();
        assert_eq!(line, r#"is {"instanceId":"0123456789abcdef","status":2}|"#);
    }

    #[test]
    fn test_log_line_escapes_and_stamps() {
        let time = UNIX_EPOCH + Duration::from_secs(3600);
        let line = log_line("0123456789abcdef", time, "50% | done").unwrap();
        assert_eq!(
            line,
            r#"il {"instanceId":"0123456789abcdef","text":"[01:00:00] 50%25 %7C done"}|"#
        );
    }

    #[test]
    fn test_error_line() {
        assert_eq!(
            error_line(COMMAND_FAILED).unwrap(),
            r#"err {"message":"Could not post command."}|"#
        );
    }
}
