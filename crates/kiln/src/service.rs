//! Binary protocol handlers for the control panel.
//!
//! Payload layouts (strings are length-prefixed UTF-8):
//!
//! | Header                  | Request                      | Reply                            |
//! |-------------------------|------------------------------|----------------------------------|
//! | `New`                   | package, configuration       | instance id, package             |
//! | `List`                  | (empty)                      | count, summaries                 |
//! | `Command`               | instance id, command         | `Error` on failure only          |
//! | `Terminate`             | instance id                  | `Error` on failure only          |
//! | `InstanceConfiguration` | instance id                  | instance id, configuration       |
//!
//! `InstanceStatus` (id, status) and `InstanceLog` (id, text) are pushed
//! with no request id.

use std::sync::{Arc, LazyLock};

use kiln_instance::{InstanceError, InstanceManager, PackageCatalog};
use kiln_protocol::{
    BufferError, Frame, FrameBuilder, Header, InstanceConfiguration, InstanceStatus, NO_REQUEST_ID,
};
use kiln_transport::Connection;
use regex::Regex;

use crate::KilnError;
use crate::dispatch::Dispatcher;

static INSTANCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-f0-9]{16}$").expect("static regex is valid"));

pub const PACKAGE_NOT_FOUND: &str = "The package was not found.";
pub const INVALID_CONFIGURATION: &str = "Invalid configuration sent.";
pub const INSTANCE_NOT_FOUND: &str = "Instance not found.";

/// State shared by the binary handlers.
#[derive(Clone)]
pub struct HostService {
    manager: Arc<InstanceManager>,
    catalog: Arc<dyn PackageCatalog>,
}

impl HostService {
    pub fn new(manager: Arc<InstanceManager>, catalog: Arc<dyn PackageCatalog>) -> Self {
        Self { manager, catalog }
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// A dispatcher with every request header bound.
    pub fn into_dispatcher(self) -> Dispatcher<HostService> {
        let mut dispatcher = Dispatcher::new(self);
        dispatcher
            .register(Header::New, on_new_instance)
            .register(Header::List, on_list)
            .register(Header::Command, on_command)
            .register(Header::Terminate, on_terminate)
            .register(Header::InstanceConfiguration, on_configuration);
        dispatcher
    }
}

/// Returns `true` for sixteen lowercase hex characters.
pub fn is_instance_id(id: &str) -> bool {
    INSTANCE_ID.is_match(id)
}

fn on_new_instance(service: &HostService, conn: &Connection, frame: Frame) -> Result<(), KilnError> {
    let mut reader = frame.reader();
    let package_name = reader.read_string()?;
    let configuration = InstanceConfiguration::read_from(&mut reader)?;

    let Some(package) = service.catalog.find(&package_name) else {
        tracing::warn!(conn_id = %conn.id(), package = %package_name, "package not found");
        return send_error(conn, PACKAGE_NOT_FOUND, frame.request_id);
    };

    let instance = match service.manager.create_and_start(package, configuration) {
        Ok(instance) => instance,
        Err(InstanceError::InvalidConfiguration(e)) => {
            tracing::warn!(conn_id = %conn.id(), error = %e, "invalid configuration");
            return send_error(conn, INVALID_CONFIGURATION, frame.request_id);
        }
        Err(e @ (InstanceError::CapacityExceeded | InstanceError::NoBindingAvailable)) => {
            tracing::warn!(conn_id = %conn.id(), error = %e, "instance refused");
            return send_error(
                conn,
                &InstanceError::CapacityExceeded.to_string(),
                frame.request_id,
            );
        }
        Err(e) => {
            tracing::error!(conn_id = %conn.id(), error = %e, "instance could not be created");
            return send_error(conn, &e.to_string(), frame.request_id);
        }
    };

    let mut reply = FrameBuilder::new(Header::New, frame.request_id)?;
    reply
        .write_str(instance.id())?
        .write_str(&instance.package().name)?;
    conn.send(&reply.finish()?)?;
    Ok(())
}

fn on_list(service: &HostService, conn: &Connection, frame: Frame) -> Result<(), KilnError> {
    let summaries = service.manager.summaries();
    let count = i32::try_from(summaries.len()).map_err(|_| BufferError::Overflow {
        requested: summaries.len(),
        max: i32::MAX as usize,
    })?;

    let mut reply = FrameBuilder::new(Header::List, frame.request_id)?;
    reply.write_i32(count)?;
    for summary in &summaries {
        summary.write_to(reply.buffer_mut())?;
    }
    conn.send(&reply.finish()?)?;
    Ok(())
}

fn on_command(service: &HostService, conn: &Connection, frame: Frame) -> Result<(), KilnError> {
    let mut reader = frame.reader();
    let instance_id = reader.read_string()?;
    let command = reader.read_string()?;

    if !is_instance_id(&instance_id) {
        tracing::warn!(conn_id = %conn.id(), %instance_id, "ignored command with invalid instance id");
        return Ok(());
    }
    if command.is_empty() {
        tracing::warn!(conn_id = %conn.id(), %instance_id, "ignored empty command");
        return Ok(());
    }

    if service.manager.post_command(&instance_id, &command) {
        tracing::info!(%instance_id, %command, "command posted");
        Ok(())
    } else {
        tracing::warn!(%instance_id, "command refused: instance not found or not running");
        send_error(conn, INSTANCE_NOT_FOUND, frame.request_id)
    }
}

fn on_terminate(service: &HostService, conn: &Connection, frame: Frame) -> Result<(), KilnError> {
    let instance_id = frame.reader().read_string()?;

    if !is_instance_id(&instance_id) {
        tracing::warn!(conn_id = %conn.id(), %instance_id, "ignored terminate with invalid instance id");
        return Ok(());
    }

    if service.manager.terminate(&instance_id) {
        tracing::warn!(%instance_id, "terminating instance");
        Ok(())
    } else {
        tracing::warn!(%instance_id, "terminate refused: instance not found or not running");
        send_error(conn, INSTANCE_NOT_FOUND, frame.request_id)
    }
}

fn on_configuration(service: &HostService, conn: &Connection, frame: Frame) -> Result<(), KilnError> {
    let instance_id = frame.reader().read_string()?;

    let Some(configuration) = service.manager.configuration(&instance_id) else {
        return send_error(conn, INSTANCE_NOT_FOUND, frame.request_id);
    };

    let mut reply = FrameBuilder::new(Header::InstanceConfiguration, frame.request_id)?;
    reply.write_str(&instance_id)?;
    configuration.write_to(reply.buffer_mut())?;
    conn.send(&reply.finish()?)?;
    Ok(())
}

/// Answers `request_id` with an `Error` frame.
pub fn send_error(conn: &Connection, message: &str, request_id: i32) -> Result<(), KilnError> {
    conn.send(&error_frame(message, request_id)?)?;
    Ok(())
}

pub fn error_frame(message: &str, request_id: i32) -> Result<Vec<u8>, BufferError> {
    let mut frame = FrameBuilder::new(Header::Error, request_id)?;
    frame.write_str(message)?;
    frame.finish()
}

pub fn status_frame(instance_id: &str, status: InstanceStatus) -> Result<Vec<u8>, BufferError> {
    let mut frame = FrameBuilder::new(Header::InstanceStatus, NO_REQUEST_ID)?;
    frame.write_str(instance_id)?.write_i32(status.as_i32())?;
    frame.finish()
}

pub fn log_frame(instance_id: &str, text: &str) -> Result<Vec<u8>, BufferError> {
    let mut frame = FrameBuilder::new(Header::InstanceLog, NO_REQUEST_ID)?;
    frame.write_str(instance_id)?.write_str(text)?;
    frame.finish()
}

#[cfg(test)]
mod tests {
    use kiln_protocol::{FrameDecoder, HEADER_SIZE};

    use super::*;

    fn decode(bytes: &[u8]) -> Frame {
        let mut decoder = FrameDecoder::new();
        decoder.feed(bytes).unwrap();
        decoder.next_frame().unwrap().expect("complete frame")
    }

    #[test]
    fn test_instance_id_shape() {
        assert!(is_instance_id("0123456789abcdef"));
        assert!(!is_instance_id("0123456789ABCDEF"));
        assert!(!is_instance_id("0123456789abcde"));
        assert!(!is_instance_id("0123456789abcdef0"));
        assert!(!is_instance_id("../../etc/passwd"));
    }

    #[test]
    fn test_status_push_layout() {
        let bytes = status_frame("0123456789abcdef", InstanceStatus::Running).unwrap();
        let frame = decode(&bytes);
        assert_eq!(frame.header, Header::InstanceStatus);
        assert_eq!(frame.request_id, NO_REQUEST_ID);
        let mut reader = frame.reader();
        assert_eq!(reader.read_string().unwrap(), "0123456789abcdef");
        assert_eq!(reader.read_i32().unwrap(), 2);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_error_reply_echoes_request_id() {
        let bytes = error_frame(INSTANCE_NOT_FOUND, 41).unwrap();
        assert_eq!(&bytes[..4], &Header::Error.as_i32().to_le_bytes());
        assert_eq!(&bytes[4..8], &41i32.to_le_bytes());
        let frame = decode(&bytes);
        assert_eq!(frame.reader().read_string().unwrap(), INSTANCE_NOT_FOUND);
        assert_eq!(bytes.len(), HEADER_SIZE + frame.payload.len());
    }

    #[test]
    fn test_log_push_layout() {
        let frame = decode(&log_frame("0123456789abcdef", "Done (1.2s)!").unwrap());
        assert_eq!(frame.header, Header::InstanceLog);
        let mut reader = frame.reader();
        reader.read_string().unwrap();
        assert_eq!(reader.read_string().unwrap(), "Done (1.2s)!");
    }
}
