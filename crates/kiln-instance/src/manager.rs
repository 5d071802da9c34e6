//! Instance manager: creates, tracks, and reaps instances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_protocol::{InstanceConfiguration, InstanceSummary};
use parking_lot::Mutex;
use rand::Rng;

use crate::console::ConsoleFilter;
use crate::events::Listeners;
use crate::instance::Context;
use crate::log::LogEntry;
use crate::{
    BindingPool, Instance, InstanceError, InstanceEvents, JavaLauncher, Package, ProcessLauncher,
    ReadyPredicate, StartsWithReady,
};

/// Delay between a shutdown request and the `stop` command.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

/// How long [`InstanceManager::shutdown`] waits before killing.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns every live instance and the binding pool they lease from.
///
/// Shared between the protocol handlers and the reaper; all methods take
/// `&self` and lock only around map updates.
pub struct InstanceManager {
    instances: Mutex<Vec<Arc<Instance>>>,
    bindings: BindingPool,
    max_concurrent: usize,
    shutdown_timeout: Duration,
    listeners: Listeners,
    ctx: Arc<Context>,
}

impl InstanceManager {
    pub fn builder(root: impl Into<PathBuf>) -> InstanceManagerBuilder {
        InstanceManagerBuilder::new(root)
    }

    /// Registers a subscriber for status and console events.
    pub fn add_listener(&self, listener: Arc<dyn InstanceEvents>) {
        self.listeners.add(listener);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn bindings(&self) -> &BindingPool {
        &self.bindings
    }

    /// Creates an instance without starting it. Fails fast when the cap
    /// is reached or no endpoint is free.
    pub fn create(
        &self,
        package: Package,
        configuration: InstanceConfiguration,
    ) -> Result<Arc<Instance>, InstanceError> {
        let mut instances = self.instances.lock();
        if instances.len() >= self.max_concurrent {
            return Err(InstanceError::CapacityExceeded);
        }
        let binding = self.bindings.allocate()?;

        let id = loop {
            let id = generate_id();
            if !instances.iter().any(|i| i.id() == id) {
                break id;
            }
        };

        tracing::info!(instance_id = %id, package = %package.name, %binding, "instance created");
        let instance = Arc::new(Instance::new(
            id,
            package,
            binding,
            configuration,
            Arc::clone(&self.ctx),
        ));
        instances.push(Arc::clone(&instance));
        Ok(instance)
    }

    /// Validates `configuration`, creates an instance and starts it.
    /// Nothing is allocated if validation fails.
    pub fn create_and_start(
        &self,
        package: Package,
        configuration: InstanceConfiguration,
    ) -> Result<Arc<Instance>, InstanceError> {
        configuration.validate()?;
        let instance = self.create(package, configuration)?;
        if let Err(e) = instance.start() {
            self.instances.lock().retain(|i| !Arc::ptr_eq(i, &instance));
            self.release(&instance);
            return Err(e);
        }
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances.lock().iter().find(|i| i.id() == id).cloned()
    }

    /// All instances in creation order.
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.lock().clone()
    }

    pub fn summaries(&self) -> Vec<InstanceSummary> {
        self.instances().iter().map(|i| i.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    pub fn post_command(&self, id: &str, command: &str) -> bool {
        self.get(id).is_some_and(|i| i.post_command(command))
    }

    pub fn post_shutdown(&self, id: &str) -> bool {
        self.get(id).is_some_and(|i| i.post_shutdown())
    }

    pub fn terminate(&self, id: &str) -> bool {
        self.get(id).is_some_and(|i| i.terminate())
    }

    pub fn configuration(&self, id: &str) -> Option<InstanceConfiguration> {
        self.get(id).map(|i| i.configuration().clone())
    }

    pub fn last_log(&self, id: &str, max: usize) -> Vec<LogEntry> {
        self.get(id).map(|i| i.last_log(max)).unwrap_or_default()
    }

    /// Appends a line to an instance's history. Returns `false` if the
    /// instance does not exist.
    pub fn append_log(&self, id: &str, text: &str) -> bool {
        match self.get(id) {
            Some(instance) => {
                instance.append_log(text);
                true
            }
            None => false,
        }
    }

    /// Removes and disposes every instance in a terminal state. Returns
    /// how many were removed.
    pub fn remove_dead_instances(&self) -> usize {
        let dead: Vec<_> = {
            let mut instances = self.instances.lock();
            let (dead, live): (Vec<_>, Vec<_>) = std::mem::take(&mut *instances)
                .into_iter()
                .partition(|i| i.status().is_terminal());
            *instances = live;
            dead
        };
        for instance in &dead {
            tracing::info!(instance_id = %instance.id(), status = %instance.status(), "removing dead instance");
            self.release(instance);
        }
        dead.len()
    }

    /// Stops every instance and waits for them.
    pub fn shutdown(&self) {
        let instances = std::mem::take(&mut *self.instances.lock());
        if instances.is_empty() {
            return;
        }
        tracing::info!(count = instances.len(), "shutting down instances");
        for instance in &instances {
            instance.post_shutdown();
        }
        for instance in &instances {
            self.release(instance);
        }
    }

    fn release(&self, instance: &Instance) {
        instance.dispose(self.shutdown_timeout);
        if let Err(e) = self.bindings.free(instance.binding().clone()) {
            tracing::error!(instance_id = %instance.id(), error = %e, "binding release failed");
        }
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sixteen lowercase hex characters.
fn generate_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Configures an [`InstanceManager`].
///
/// ```no_run
/// use kiln_instance::{BindingPool, InstanceManager};
///
/// let pool = BindingPool::from_entries(["0.0.0.0:25565"]).unwrap();
/// let manager = InstanceManager::builder("/srv/kiln")
///     .max_concurrent(4)
///     .bindings(pool)
///     .build();
/// assert!(manager.is_empty());
/// ```
pub struct InstanceManagerBuilder {
    root: PathBuf,
    max_concurrent: usize,
    bindings: BindingPool,
    launcher: Arc<dyn ProcessLauncher>,
    ready: Arc<dyn ReadyPredicate>,
    console: ConsoleFilter,
    stop_grace: Duration,
    shutdown_timeout: Duration,
}

impl InstanceManagerBuilder {
    fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_concurrent: 1,
            bindings: BindingPool::default(),
            launcher: Arc::new(JavaLauncher),
            ready: Arc::new(StartsWithReady),
            console: ConsoleFilter::default(),
            stop_grace: DEFAULT_STOP_GRACE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn bindings(mut self, bindings: BindingPool) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn launcher(mut self, launcher: impl ProcessLauncher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    pub fn ready_predicate(mut self, ready: impl ReadyPredicate + 'static) -> Self {
        self.ready = Arc::new(ready);
        self
    }

    pub fn console_filter(mut self, console: ConsoleFilter) -> Self {
        self.console = console;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Working directories live under `<root>/instances/<id>`.
    pub fn build(self) -> InstanceManager {
        let listeners = Listeners::default();
        let ctx = Arc::new(Context {
            instances_dir: self.root.join("instances"),
            launcher: self.launcher,
            ready: self.ready,
            console: self.console,
            listeners: listeners.clone(),
            stop_grace: self.stop_grace,
        });
        InstanceManager {
            instances: Mutex::new(Vec::new()),
            bindings: self.bindings,
            max_concurrent: self.max_concurrent,
            shutdown_timeout: self.shutdown_timeout,
            listeners,
            ctx,
        }
    }
}
