//! Connection runtime for the Scope Transport Protocol.
//!
//! One reactor thread owns the socket: it decodes inbound frames, matches
//! responses to waiting calls by tag, and hands events to a dispatcher
//! thread. Callers block on (or await) their own result slot, so any number
//! of threads can issue commands over one connection at once.

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod events;
pub mod handshake;
pub mod listener;
pub mod message;
mod pending;
mod reactor;
pub mod registry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::RuntimeConfig;
pub use connection::Connection;
pub use connector::{connect, connect_with_config};
pub use error::{Result, ScopeError};
pub use events::{Event, EventDispatcher, EventHandler, EventHandlerError};
pub use handshake::{
    EnableRequest, EnableResponse, HandshakeConfig, ScopeCommand, ServiceRequest, ENABLE,
    HOST_INFO,
};
pub use listener::ConnectionListener;
pub use message::{encode_payload, ErrorInfo, Message, Response};
pub use reactor::ConnectionState;
pub use registry::{
    parse_service_version, Capability, CapabilitySet, HostInfo, ServiceDescriptor, ServiceInfo,
    ServiceRegistry,
};
pub use stp_frame::SCOPE_SERVICE;
