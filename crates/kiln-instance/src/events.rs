//! Subscribers for instance status changes and console output.

use std::sync::Arc;
use std::time::SystemTime;

use kiln_protocol::InstanceStatus;
use parking_lot::RwLock;

/// Receives instance events. Called from instance worker threads, so
/// implementations must not block for long.
pub trait InstanceEvents: Send + Sync {
    fn on_status(&self, instance_id: &str, status: InstanceStatus);

    fn on_log(&self, instance_id: &str, time: SystemTime, text: &str);
}

/// The listener list shared between the manager and its instances.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn InstanceEvents>>>>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn InstanceEvents>) {
        self.inner.write().push(listener);
    }

    pub(crate) fn status(&self, instance_id: &str, status: InstanceStatus) {
        for listener in self.inner.read().iter() {
            listener.on_status(instance_id, status);
        }
    }

    pub(crate) fn log(&self, instance_id: &str, time: SystemTime, text: &str) {
        for listener in self.inner.read().iter() {
            listener.on_log(instance_id, time, text);
        }
    }
}
