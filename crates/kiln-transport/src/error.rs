/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the listening socket failed.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Sending data failed. The connection is flagged for disconnect.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// The peer stopped draining its queued output.
    #[error("send queue full on {0}")]
    SendQueueFull(crate::ConnectionId),

    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The connection was already flagged for disconnect.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}
