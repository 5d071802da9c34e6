//! Unified error type for the Kiln host.

use kiln_instance::InstanceError;
use kiln_protocol::{BufferError, ProtocolError};
use kiln_transport::TransportError;

use crate::config::ConfigError;
use crate::correlation::RequestError;

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    /// Socket level: bind, send, closed peer.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame, header or payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Read past the end of a payload or a buffer over its cap.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Instance creation, lifecycle or binding failures.
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// The settings file is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A correlated request timed out or was cancelled.
    #[error(transparent)]
    Request(#[from] RequestError),
}
