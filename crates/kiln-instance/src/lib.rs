//! Instance supervision for Kiln.
//!
//! Each [`Instance`] is one server process driven by a dedicated worker
//! thread through `Idle → Starting → Running → Stopping → Stopped`, with
//! `Error` reachable whenever preparation or the process itself fails.
//!
//! # Key types
//!
//! - [`InstanceManager`]: creates, tracks and reaps instances
//! - [`BindingPool`]: the endpoints instances bind to
//! - [`ProcessLauncher`]: how the child process is spawned
//! - [`ReadyPredicate`]: which console line means "started"
//! - [`InstanceEvents`]: status and console subscribers

mod binding;
pub mod console;
mod error;
mod events;
mod instance;
mod launcher;
pub mod log;
mod manager;
mod package;
pub mod properties;
mod ready;

pub use binding::{BindingEndpoint, BindingPool};
pub use console::ConsoleFilter;
pub use error::InstanceError;
pub use events::InstanceEvents;
pub use instance::Instance;
pub use launcher::{JavaLauncher, ProcessLauncher};
pub use log::{InstanceLog, LogEntry, MAX_LOG_ENTRIES};
pub use manager::{
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STOP_GRACE, InstanceManager, InstanceManagerBuilder,
};
pub use package::{Package, PackageCatalog, StaticCatalog};
pub use properties::ServerProperties;
pub use ready::{ReadyPredicate, StartsWithReady};
