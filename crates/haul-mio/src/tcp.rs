use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
};

use mio::{net::TcpStream, Interest, Token};
use tracing::{event, Level};

use crate::{Connect, Registry, Transport};

/// Plaintext TCP transport.
///
/// Opened over a list of addresses: if connecting to one fails, the next is tried under the
/// same registration until none are left.
pub struct TcpTransport {
    stream: TcpStream,
    connected: bool,
    fallback: VecDeque<SocketAddr>,
    registration: Option<(Token, Interest)>,
}

impl TcpTransport {
    /// Start a non-blocking connect to `addr`.
    pub fn open(addr: SocketAddr) -> io::Result<Self> {
        Self::open_any(&[addr])
    }

    /// Start a non-blocking connect to the first address that accepts one, keeping the rest
    /// for when that connect fails.
    pub fn open_any(addresses: &[SocketAddr]) -> io::Result<Self> {
        let mut fallback: VecDeque<_> = addresses.iter().copied().collect();
        let stream = start(&mut fallback)?;

        Ok(Self {
            stream,
            connected: false,
            fallback,
            registration: None,
        })
    }

    /// Replace a socket whose connect failed with one to the next address.
    fn fall_back(&mut self, registry: &Registry, error: io::Error) -> io::Result<Connect> {
        if self.fallback.is_empty() {
            return Err(error);
        }
        event!(Level::DEBUG, ?error, "connect failed, trying next address");

        let stream = start(&mut self.fallback)?;
        let mut failed = std::mem::replace(&mut self.stream, stream);

        if let Some((token, interest)) = self.registration {
            registry.deregister(&mut failed)?;
            registry.register(&mut self.stream, token, interest)?;
        }

        Ok(Connect::Pending)
    }
}

/// Open a socket to the first address in `addresses` that starts connecting.
fn start(addresses: &mut VecDeque<SocketAddr>) -> io::Result<TcpStream> {
    let mut last_error = None;

    while let Some(addr) = addresses.pop_front() {
        event!(Level::TRACE, ?addr, "connecting");

        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                event!(Level::DEBUG, ?addr, ?error, "connect failed");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ErrorKind::NotFound.into()))
}

impl Transport for TcpTransport {
    fn connect(&mut self, registry: &Registry) -> io::Result<Connect> {
        if self.connected {
            return Ok(Connect::Ready);
        }

        // A failed connect shows up as a pending socket error
        if let Some(error) = self.stream.take_error()? {
            return self.fall_back(registry, error);
        }

        match self.stream.peer_addr() {
            Ok(peer) => {
                event!(Level::TRACE, ?peer, "connected");
                self.connected = true;
                self.fallback.clear();
                Ok(Connect::Ready)
            }
            Err(error) if matches!(error.kind(), ErrorKind::NotConnected | ErrorKind::WouldBlock) => {
                Ok(Connect::Pending)
            }
            Err(error) => self.fall_back(registry, error),
        }
    }

    fn interest(&self, wanted: Interest) -> Interest {
        if self.connected {
            wanted
        } else {
            // Connect completion is reported as writable
            Interest::WRITABLE
        }
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)?;
        self.registration = Some((token, interest));
        Ok(())
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)?;
        self.registration = Some((token, interest));
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.registration = None;
        registry.deregister(&mut self.stream)
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
