use std::net::ToSocketAddrs;

use crate::config::RuntimeConfig;
use crate::connection::Connection;
use crate::error::Result;

/// Connect to a browser's scope port and negotiate every advertised service.
pub fn connect(addr: impl ToSocketAddrs) -> Result<Connection> {
    connect_with_config(addr, RuntimeConfig::default())
}

/// Connect with explicit configuration.
pub fn connect_with_config(addr: impl ToSocketAddrs, config: RuntimeConfig) -> Result<Connection> {
    let stream = stp_transport::connect_timeout(addr, config.connect_timeout)?;
    Connection::establish(stream, config)
}
