//! Error types for the instance layer.

use std::path::PathBuf;

use kiln_protocol::{InstanceStatus, ProtocolError};

use crate::BindingEndpoint;

/// Errors that can occur while creating or supervising instances.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    /// The concurrent-instance cap has been reached.
    #[error("The maximum amount of concurrent instances has been exceeded.")]
    CapacityExceeded,

    /// Every binding endpoint is leased.
    #[error("no binding endpoint is available")]
    NoBindingAvailable,

    /// An endpoint was returned that the pool never handed out.
    #[error("binding {0} is not allocated (double free?)")]
    NotAllocated(BindingEndpoint),

    /// The pool cannot be reloaded while endpoints are leased.
    #[error("cannot reload bindings while {0} are allocated")]
    BindingsInUse(usize),

    /// A binding entry is malformed or duplicated.
    #[error("invalid binding '{entry}': {reason}")]
    InvalidBinding { entry: String, reason: &'static str },

    /// The instance configuration failed validation.
    #[error(transparent)]
    InvalidConfiguration(#[from] ProtocolError),

    #[error("instance {id} is {status} and cannot {action}")]
    InvalidState {
        id: String,
        status: InstanceStatus,
        action: &'static str,
    },

    #[error("package archive {0} does not exist")]
    PackageMissing(PathBuf),

    #[error("could not extract package: {0}")]
    Extract(#[from] zip::result::ZipError),

    #[error("could not start process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
