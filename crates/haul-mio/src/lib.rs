//! Non-blocking transports over a shared mio readiness registry.

mod connector;
mod registry;
mod tcp;
mod tls;
mod transport;

use std::io::{self, ErrorKind};

pub use self::{
    connector::{Connector, Endpoint, NetConnector, TlsMode},
    registry::Registry,
    tcp::TcpTransport,
    tls::{TlsConfigs, TlsTransport},
    transport::{Connect, Transport},
};

/// Fold "try again later" results into `None`.
pub fn check_io<T>(value: io::Result<T>) -> io::Result<Option<T>> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            // WouldBlock just means we've run out of things to handle
            if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
                Ok(None)
            } else {
                Err(error)
            }
        }
    }
}
