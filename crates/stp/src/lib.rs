//! Scope Transport Protocol client for driving browsers.
//!
//! stp talks to a browser's scope module over a single TCP connection:
//! binary frames, concurrent tagged commands, per-service version
//! negotiation and pushed events.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP connect/listen plumbing
//! - [`frame`]: Frame codec and blocking/async framed I/O
//! - [`runtime`]: Connection reactor, call correlation, handshake and events
//! - [`services`]: Typed service façades (behind `services` feature)

/// Re-export transport types.
pub mod transport {
    pub use stp_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use stp_frame::*;
}

/// Re-export runtime types.
pub mod runtime {
    pub use stp_runtime::*;
}

/// Re-export service façades (requires `services` feature).
#[cfg(feature = "services")]
pub mod services {
    pub use stp_services::*;
}

pub use stp_runtime::{connect, connect_with_config, Connection, RuntimeConfig, ScopeError};
