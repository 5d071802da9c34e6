//! Instance events fanned out to connected peers.
//!
//! Instance workers must not block on slow sockets, so the listener only
//! queues events; the server loop drains the queue and broadcasts on its
//! own thread.

use std::time::SystemTime;

use crossbeam::channel::{self, Receiver, Sender};
use kiln_instance::InstanceEvents;
use kiln_protocol::InstanceStatus;
use kiln_transport::{ServerHandle, websocket};

use crate::{service, web};

/// One queued instance event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Status {
        instance_id: String,
        status: InstanceStatus,
    },
    Log {
        instance_id: String,
        time: SystemTime,
        text: String,
    },
}

/// The [`InstanceEvents`] listener registered with the manager.
pub struct EventSink {
    tx: Sender<ServiceEvent>,
}

impl InstanceEvents for EventSink {
    fn on_status(&self, instance_id: &str, status: InstanceStatus) {
        let _ = self.tx.send(ServiceEvent::Status {
            instance_id: instance_id.to_string(),
            status,
        });
    }

    fn on_log(&self, instance_id: &str, time: SystemTime, text: &str) {
        let _ = self.tx.send(ServiceEvent::Log {
            instance_id: instance_id.to_string(),
            time,
            text: text.to_string(),
        });
    }
}

/// Drains queued events into both listeners.
pub struct EventFanout {
    rx: Receiver<ServiceEvent>,
    binary: ServerHandle,
    web: Option<ServerHandle>,
}

impl EventFanout {
    /// Returns the fan-out and the sink to register with the manager.
    pub fn new(binary: ServerHandle, web: Option<ServerHandle>) -> (Self, EventSink) {
        let (tx, rx) = channel::unbounded();
        (Self { rx, binary, web }, EventSink { tx })
    }

    /// Broadcasts every queued event. Returns how many were sent.
    pub fn flush(&self) -> usize {
        let mut sent = 0;
        for event in self.rx.try_iter() {
            self.broadcast(&event);
            sent += 1;
        }
        sent
    }

    fn broadcast(&self, event: &ServiceEvent) {
        let (frame, line) = match event {
            ServiceEvent::Status {
                instance_id,
                status,
            } => (
                service::status_frame(instance_id, *status),
                web::status_line(instance_id, *status),
            ),
            ServiceEvent::Log {
                instance_id,
                time,
                text,
            } => (
                service::log_frame(instance_id, text),
                web::log_line(instance_id, *time, text),
            ),
        };

        match frame {
            Ok(frame) => self.binary.broadcast(&frame),
            Err(e) => {
                tracing::error!(error = %e, "could not encode event frame");
            }
        }
        if let Some(web) = &self.web {
            match line {
                Ok(line) => websocket::broadcast_text(web, &line),
                Err(e) => tracing::error!(error = %e, "could not encode event line"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_queues_in_order() {
        let (fanout, sink) = EventFanout::new(ServerHandle::default(), None);
        sink.on_status("0123456789abcdef", InstanceStatus::Starting);
        sink.on_log("0123456789abcdef", SystemTime::UNIX_EPOCH, "Loading");
        sink.on_status("0123456789abcdef", InstanceStatus::Running);

        let events: Vec<_> = fanout.rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            ServiceEvent::Status { status: InstanceStatus::Starting, .. }
        ));
        assert!(matches!(&events[1], ServiceEvent::Log { text, .. } if text == "Loading"));
    }

    #[test]
    fn test_flush_with_no_peers_drains_queue() {
        let (fanout, sink) = EventFanout::new(ServerHandle::default(), Some(ServerHandle::default()));
        sink.on_status("0123456789abcdef", InstanceStatus::Stopped);
        assert_eq!(fanout.flush(), 1);
        assert_eq!(fanout.flush(), 0);
    }
}
