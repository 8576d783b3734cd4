use std::fmt;
use std::io;

use stp_frame::FrameError;
use stp_runtime::ScopeError;
use stp_services::ServiceError;
use stp_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
/// The browser answered a command with an error status.
pub const REMOTE_ERROR: i32 = 5;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HANDSHAKE_FAILED: i32 = 4;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
/// The negotiated service version cannot serve the request.
pub const UNAVAILABLE: i32 = 69;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable => TRANSPORT_ERROR,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Unresolved(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::FrameTooLarge { .. } | FrameError::OversizedFrameSkipped { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn scope_error(context: &str, err: ScopeError) -> CliError {
    match err {
        ScopeError::Transport(err) => transport_error(context, err),
        ScopeError::Frame(err) => frame_error(context, err),
        ScopeError::Io(err) => io_error(context, err),
        ScopeError::Timeout { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ScopeError::Disconnected(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        ScopeError::HandshakeFailed(_) => {
            CliError::new(HANDSHAKE_FAILED, format!("{context}: {err}"))
        }
        ScopeError::Remote { .. } => CliError::new(REMOTE_ERROR, format!("{context}: {err}")),
        ScopeError::FeatureUnavailable { .. } | ScopeError::UnknownService(_) => {
            CliError::new(UNAVAILABLE, format!("{context}: {err}"))
        }
        ScopeError::InvalidVersion(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ScopeError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn service_error(context: &str, err: ServiceError) -> CliError {
    match err {
        ServiceError::Scope(err) => scope_error(context, err),
        ServiceError::InvalidArgument(_) => CliError::new(USAGE, format!("{context}: {err}")),
        ServiceError::UnsupportedAction(_) => {
            CliError::new(UNAVAILABLE, format!("{context}: {err}"))
        }
    }
}
