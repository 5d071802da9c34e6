//! # Kiln
//!
//! Hosts game-server instances on one machine and exposes them to a
//! control panel over a binary TCP protocol and to browsers over
//! WebSocket.
//!
//! The host side is [`KilnServer`]; the control-panel side is
//! [`HostClient`]. Both speak the frames defined in [`kiln_protocol`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kiln::prelude::*;
//!
//! let settings = Settings::from_toml(r#"
//!     [service]
//!     binding = "127.0.0.1:7000"
//!
//!     [instances]
//!     root = "/srv/kiln"
//!     bindings = ["0.0.0.0:25565"]
//! "#)?;
//! let mut server = KilnServer::builder(settings).build()?;
//! server.run();
//! # Ok::<(), KilnError>(())
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod correlation;
pub mod dispatch;
mod error;
pub mod events;
pub mod jobs;
pub mod server;
pub mod service;
pub mod web;

pub use client::{ClientEvents, HostClient, NoEvents};
pub use error::KilnError;
pub use server::{KilnServer, KilnServerBuilder, ShutdownHandle};

/// Convenient imports for embedding the host or the client.
pub mod prelude {
    pub use crate::auth::{AccountRole, Authorizer, StaticAuthorizer, User};
    pub use crate::client::{ClientEvents, HostClient, NoEvents};
    pub use crate::config::Settings;
    pub use crate::correlation::RequestError;
    pub use crate::server::{KilnServer, ShutdownHandle};
    pub use crate::KilnError;
    pub use kiln_instance::{InstanceManager, Package, PackageCatalog, ProcessLauncher, StaticCatalog};
    pub use kiln_protocol::{Header, InstanceConfiguration, InstanceStatus, InstanceSummary};
}
