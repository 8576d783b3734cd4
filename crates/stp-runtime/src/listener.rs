use std::net::{SocketAddr, ToSocketAddrs};

use stp_transport::ScopeListener;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::handshake::HandshakeConfig;

/// Waits for browsers that dial back to the client.
///
/// Browsers started with a remote debugging target open the connection
/// themselves; the client side still drives the handshake.
pub struct ConnectionListener {
    listener: ScopeListener,
    config: RuntimeConfig,
}

impl ConnectionListener {
    /// Bind to a TCP address. Port 0 picks an ephemeral port.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        Ok(Self {
            listener: ScopeListener::bind(addr)?,
            config: RuntimeConfig::default(),
        })
    }

    /// Override runtime config for accepted connections.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Override handshake config for accepted connections.
    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.config.handshake = config;
        self
    }

    /// Accept the next browser and negotiate services with it.
    pub fn accept(&self) -> Result<Connection> {
        let stream = self.listener.accept()?;
        debug!(peer = ?stream.peer_addr().ok(), "browser dialed in");
        Connection::establish(stream, self.config.clone())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::ServiceRequest;
    use crate::testing::FakeBrowser;

    #[test]
    fn accept_negotiates_with_dialing_browser() {
        let listener = ConnectionListener::bind("127.0.0.1:0").expect("listener should bind");
        let _browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .dial(listener.local_addr())
            .expect("fake browser should dial");

        let conn = listener.accept().expect("listener should accept");
        assert!(conn.is_ready());
        assert!(conn.is_version_at_least("exec", "2.2"));
    }

    #[test]
    fn handshake_config_applies_to_accepted_connections() {
        let listener = ConnectionListener::bind("127.0.0.1:0")
            .expect("listener should bind")
            .with_handshake_config(
                HandshakeConfig::default().with_services([ServiceRequest::new("window-manager")]),
            );
        let _browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .service("window-manager", "2.0")
            .dial(listener.local_addr())
            .expect("fake browser should dial");

        let conn = listener.accept().expect("listener should accept");
        assert!(conn.registry().contains("window-manager"));
        assert!(!conn.registry().contains("exec"));
    }

    #[test]
    fn accepts_multiple_sequential_browsers() {
        let listener = ConnectionListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr();

        let _first = FakeBrowser::builder().service("exec", "2.0").dial(addr).expect("dial");
        let a = listener.accept().expect("first accept should succeed");
        let _second = FakeBrowser::builder().service("exec", "2.2").dial(addr).expect("dial");
        let b = listener.accept().expect("second accept should succeed");

        assert!(!a.is_version_at_least("exec", "2.2"));
        assert!(b.is_version_at_least("exec", "2.2"));
    }
}
