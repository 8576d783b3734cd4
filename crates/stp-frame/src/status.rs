//! Frame status codes and reserved protocol names.
//!
//! Status values follow the STP/1 message types. `Command` is only ever
//! sent by the client; the browser answers with `Ok` or `Error` carrying the
//! request's tag, and pushes `Event` frames on its own.

use crate::error::FrameError;

/// Service that carries the handshake commands.
pub const SCOPE_SERVICE: &str = "scope";

/// Maximum length of a service name on the wire.
pub const MAX_SERVICE_NAME_LEN: usize = u16::MAX as usize;

/// Kind of message a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// Client-to-browser command.
    Command = 1,
    /// Successful response to a command.
    Ok = 2,
    /// Unsolicited notification from the browser.
    Event = 3,
    /// Failed response to a command.
    Error = 4,
}

impl Status {
    /// Wire representation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Status::Command => "COMMAND",
            Status::Ok => "OK",
            Status::Event => "EVENT",
            Status::Error => "ERROR",
        }
    }

    /// Returns true for statuses that answer a pending command.
    pub fn is_response(self) -> bool {
        matches!(self, Status::Ok | Status::Error)
    }
}

impl TryFrom<u8> for Status {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Status::Command),
            2 => Ok(Status::Ok),
            3 => Ok(Status::Event),
            4 => Ok(Status::Error),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
