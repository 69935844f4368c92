use std::{
    collections::{hash_map::Entry, HashMap},
    io::{self, ErrorKind},
    net::{SocketAddr, ToSocketAddrs},
};

use tracing::{event, Level};

use crate::{TcpTransport, TlsConfigs, TlsTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Verified,
    /// Accept any server certificate.
    Insecure,
}

/// Where to open a transport to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Layer TLS over the stream when set.
    pub tls: Option<TlsMode>,
}

/// Opens transports for endpoints.
pub trait Connector {
    /// Start connecting, without waiting for the connection to complete.
    fn connect(&mut self, endpoint: &Endpoint) -> io::Result<Box<dyn Transport>>;
}

/// Connector for real sockets, caching resolved addresses per host and port.
///
/// Every cached address is handed to the transport, which moves on to the next one when a
/// connect fails.
#[derive(Default)]
pub struct NetConnector {
    addresses: HashMap<(String, u16), Vec<SocketAddr>>,
    tls: TlsConfigs,
}

impl NetConnector {
    fn resolve(&mut self, host: &str, port: u16) -> io::Result<&[SocketAddr]> {
        let addresses = match self.addresses.entry((host.to_string(), port)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let addresses: Vec<_> = (host, port).to_socket_addrs()?.collect();
                if addresses.is_empty() {
                    return Err(io::Error::new(
                        ErrorKind::NotFound,
                        format!("no addresses for {}", host),
                    ));
                }

                event!(Level::TRACE, host, count = addresses.len(), "resolved");
                entry.insert(addresses)
            }
        };

        Ok(addresses.as_slice())
    }
}

impl Connector for NetConnector {
    fn connect(&mut self, endpoint: &Endpoint) -> io::Result<Box<dyn Transport>> {
        let addresses = self.resolve(&endpoint.host, endpoint.port)?;
        let tcp = TcpTransport::open_any(addresses)?;

        match endpoint.tls {
            None => Ok(Box::new(tcp)),
            Some(mode) => {
                let config = self.tls.get(mode);
                let transport = TlsTransport::new(tcp, config, &endpoint.host)?;
                Ok(Box::new(transport))
            }
        }
    }
}
