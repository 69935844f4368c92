use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
    time::SystemTime,
};

use mio::{Interest, Token};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, ClientConfig, ClientConnection, OwnedTrustAnchor, RootCertStore, ServerName,
};
use tracing::{event, Level};

use crate::{check_io, Connect, Registry, TcpTransport, TlsMode, Transport};

/// Lazily built rustls client configurations, shared by every TLS transport of a run.
#[derive(Default)]
pub struct TlsConfigs {
    verified: Option<Arc<ClientConfig>>,
    insecure: Option<Arc<ClientConfig>>,
}

impl TlsConfigs {
    pub fn get(&mut self, mode: TlsMode) -> Arc<ClientConfig> {
        let slot = match mode {
            TlsMode::Verified => &mut self.verified,
            TlsMode::Insecure => &mut self.insecure,
        };

        slot.get_or_insert_with(|| Arc::new(build_config(mode)))
            .clone()
    }
}

fn build_config(mode: TlsMode) -> ClientConfig {
    event!(Level::DEBUG, ?mode, "building tls client config");
    let builder = ClientConfig::builder().with_safe_defaults();

    match mode {
        TlsMode::Verified => {
            let mut roots = RootCertStore::empty();
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    anchor.subject,
                    anchor.spki,
                    anchor.name_constraints,
                )
            }));

            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        TlsMode::Insecure => builder
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth(),
    }
}

/// Accepts whatever certificate the server presents.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// TLS client session layered over a `TcpTransport`.
///
/// The handshake runs inside `connect`. Ciphertext rustls couldn't flush is kept until the
/// next writable event, which `interest` asks for.
pub struct TlsTransport {
    tcp: TcpTransport,
    session: ClientConnection,
}

impl TlsTransport {
    pub fn new(tcp: TcpTransport, config: Arc<ClientConfig>, host: &str) -> io::Result<Self> {
        let name = ServerName::try_from(host)
            .map_err(|error| io::Error::new(ErrorKind::InvalidInput, error))?;
        let session = ClientConnection::new(config, name).map_err(tls_error)?;

        Ok(Self { tcp, session })
    }

    /// Write out buffered ciphertext. Returns false if the socket would block first.
    fn write_pending(&mut self) -> io::Result<bool> {
        while self.session.wants_write() {
            if check_io(self.session.write_tls(&mut self.tcp))?.is_none() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Read ciphertext from the socket. Returns zero on end of stream.
    fn read_ciphertext(&mut self) -> io::Result<usize> {
        let count = self.session.read_tls(&mut self.tcp)?;

        if count != 0 {
            self.session.process_new_packets().map_err(tls_error)?;
        }

        Ok(count)
    }
}

impl Transport for TlsTransport {
    fn connect(&mut self, registry: &Registry) -> io::Result<Connect> {
        if self.tcp.connect(registry)? == Connect::Pending {
            return Ok(Connect::Pending);
        }

        loop {
            if !self.write_pending()? {
                return Ok(Connect::Pending);
            }

            if !self.session.is_handshaking() {
                return Ok(Connect::Ready);
            }

            match check_io(self.read_ciphertext())? {
                Some(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed during tls handshake",
                    ))
                }
                Some(_) => {}
                None => return Ok(Connect::Pending),
            }
        }
    }

    fn interest(&self, wanted: Interest) -> Interest {
        let mut interest = self.tcp.interest(wanted);

        if self.session.wants_write() {
            interest = interest.add(Interest::WRITABLE);
        }
        if self.session.is_handshaking() && self.session.wants_read() {
            interest = interest.add(Interest::READABLE);
        }

        interest
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        self.tcp.register(registry, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.tcp.reregister(registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.tcp.deregister(registry)
    }
}

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(count) => return Ok(count),
                Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                // Closed without close_notify, still the end of the body for our purposes
                Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(0),
                Err(error) => return Err(error),
            }

            if self.read_ciphertext()? == 0 {
                return Ok(0);
            }
        }
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_pending()?;
        let count = self.session.writer().write(buf)?;
        self.write_pending()?;

        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.write_pending()? {
            Ok(())
        } else {
            Err(ErrorKind::WouldBlock.into())
        }
    }
}

fn tls_error(error: rustls::Error) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, error)
}
