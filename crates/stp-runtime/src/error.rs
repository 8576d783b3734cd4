use std::time::Duration;

/// Errors that can occur on an STP connection.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] stp_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] stp_frame::FrameError),

    /// Socket or poller error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The connection is closed; the call never completed.
    #[error("connection closed: {0}")]
    Disconnected(String),

    /// No response arrived before the deadline.
    #[error("{service} command {command_id} (tag {tag}) timed out after {after:?}")]
    Timeout {
        service: String,
        command_id: u32,
        tag: u32,
        after: Duration,
    },

    /// The browser answered with an error status.
    #[error("{service} command {command_id} failed: {detail}")]
    Remote {
        service: String,
        command_id: u32,
        detail: String,
    },

    /// The negotiated service version lacks a required capability.
    #[error("{capability} requires {service} >= {required} (negotiated: {})", negotiated.as_deref().unwrap_or("not enabled"))]
    FeatureUnavailable {
        capability: &'static str,
        service: &'static str,
        required: String,
        negotiated: Option<String>,
    },

    /// The service was not negotiated on this connection.
    #[error("service '{0}' is not enabled on this connection")]
    UnknownService(String),

    /// A version string could not be parsed.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// Too many calls are already waiting for responses.
    #[error("too many pending calls (limit {0})")]
    TooManyPending(usize),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ScopeError {
    /// Returns true when the call's deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScopeError::Timeout { .. })
    }

    /// Returns true when the failure is terminal for the connection.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            ScopeError::Disconnected(_) | ScopeError::Transport(_) | ScopeError::Io(_)
        )
    }

    /// Returns true when the browser itself reported the failure.
    pub fn is_remote(&self) -> bool {
        matches!(self, ScopeError::Remote { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScopeError>;
