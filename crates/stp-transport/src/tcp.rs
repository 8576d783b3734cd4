use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::ScopeStream;

/// Port the browser's scope module listens on (or dials back to) by default.
pub const DEFAULT_SCOPE_PORT: u16 = 7001;

/// TCP listener the browser connects back to.
///
/// When the browser is launched with a remote-debugging target, it dials the
/// client rather than the other way round. The listener accepts exactly one
/// browser per [`accept`](Self::accept) call.
pub struct ScopeListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ScopeListener {
    /// Bind and listen on the given address.
    ///
    /// Port 0 picks an ephemeral port; use [`local_addr`](Self::local_addr)
    /// to find out which.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let addrs = resolve(addr)?;
        let mut last_err = None;

        for candidate in addrs {
            match TcpListener::bind(candidate) {
                Ok(listener) => {
                    let addr = listener.local_addr().map_err(|source| TransportError::Bind {
                        addr: candidate.to_string(),
                        source,
                    })?;
                    info!(%addr, "listening for browser connection");
                    return Ok(Self { listener, addr });
                }
                Err(source) => {
                    last_err = Some(TransportError::Bind {
                        addr: candidate.to_string(),
                        source,
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TransportError::Unresolved("<empty>".to_string())))
    }

    /// Accept an incoming browser connection (blocking).
    pub fn accept(&self) -> Result<ScopeStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted browser connection");
        ScopeStream::from_tcp(stream)
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

/// Connect to a browser's scope port (blocking, OS default timeout).
pub fn connect(addr: impl ToSocketAddrs) -> Result<ScopeStream> {
    connect_inner(addr, None)
}

/// Connect to a browser's scope port, giving up after `timeout` per address.
pub fn connect_timeout(addr: impl ToSocketAddrs, timeout: Duration) -> Result<ScopeStream> {
    connect_inner(addr, Some(timeout))
}

fn connect_inner(addr: impl ToSocketAddrs, timeout: Option<Duration>) -> Result<ScopeStream> {
    let addrs = resolve(addr)?;
    let mut last_err = None;

    for candidate in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&candidate, timeout),
            None => TcpStream::connect(candidate),
        };
        match attempt {
            Ok(stream) => {
                debug!(addr = %candidate, "connected to browser scope port");
                return ScopeStream::from_tcp(stream);
            }
            Err(source) => {
                debug!(addr = %candidate, error = %source, "connect attempt failed");
                last_err = Some(TransportError::connect(candidate, source));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| TransportError::Unresolved("<empty>".to_string())))
}

fn resolve(addr: impl ToSocketAddrs) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(TransportError::Unresolved("<empty>".to_string()));
    }
    Ok(addrs)
}
