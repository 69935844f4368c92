use std::io::{self, Read, Write};

use mio::{Interest, Token};

use crate::Registry;

/// Outcome of driving a transport's connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    /// Reads and writes may proceed.
    Ready,
    /// Still connecting or handshaking, wait for the interest reported by `Transport::interest`.
    Pending,
}

/// A non-blocking byte stream to one peer.
///
/// `Read` and `Write` return `WouldBlock` when the socket isn't ready, and a read of zero
/// means the peer closed the stream cleanly. A transport may need readiness the caller didn't
/// ask for, such as write readiness to finish a handshake, so the caller registers whatever
/// `interest` returns rather than its own intent.
pub trait Transport: Read + Write {
    /// Drive connection setup forward. Call again on every readiness event until `Ready`.
    ///
    /// A transport may swap its socket here, so it gets the registry it was registered with.
    fn connect(&mut self, registry: &Registry) -> io::Result<Connect>;

    /// The interest to register, given the readiness the caller itself wants.
    fn interest(&self, wanted: Interest) -> Interest;

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
}
