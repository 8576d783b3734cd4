//! TCP transport plumbing for the Scope Transport Protocol.
//!
//! A browser session runs over exactly one TCP connection. Depending on how
//! the browser was launched, either the client dials the browser's scope
//! port ([`connect`]) or the browser dials back to a port the client listens
//! on ([`ScopeListener`]). Both paths yield a connected [`ScopeStream`].
//!
//! This is the lowest layer of the workspace. Everything else builds on top
//! of the [`ScopeStream`] type provided here.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::ScopeStream;
pub use tcp::{connect, connect_timeout, ScopeListener, DEFAULT_SCOPE_PORT};
