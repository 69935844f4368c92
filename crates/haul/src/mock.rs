use std::{
    cell::{Cell, RefCell},
    io::{self, ErrorKind, Read, Write},
    rc::Rc,
};

use haul_mio::{Connect, Connector, Endpoint, Registry, Transport};
use mio::{Interest, Token};

use crate::{
    sink::{OutputRequest, Sink, SinkFactory},
    FetchError,
};

/// How every transport a `MockConnector` opens behaves once connected.
#[derive(Clone)]
pub enum Script {
    /// Every read fails with a connection reset.
    Reset,
    /// Every read would block.
    Stall,
    /// The peer sends these bytes then closes.
    Reply(Vec<u8>),
    /// Like `Reply`, but at most this many bytes arrive before a read would block.
    Trickle(Vec<u8>, usize),
}

#[derive(Clone)]
pub struct MockConnector {
    script: Script,
    opened: Rc<Cell<usize>>,
}

impl MockConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            opened: Rc::new(Cell::new(0)),
        }
    }

    /// Transports opened so far, across clones.
    pub fn opened(&self) -> usize {
        self.opened.get()
    }
}

impl Connector for MockConnector {
    fn connect(&mut self, endpoint: &Endpoint) -> io::Result<Box<dyn Transport>> {
        if endpoint.host == "unresolvable" {
            return Err(io::Error::new(ErrorKind::NotFound, "no addresses"));
        }

        self.opened.set(self.opened.get() + 1);
        Ok(Box::new(MockTransport {
            script: self.script.clone(),
            position: 0,
            drained: false,
        }))
    }
}

struct MockTransport {
    script: Script,
    position: usize,
    /// Set after a trickled read, the next read would block.
    drained: bool,
}

impl MockTransport {
    fn reply(&mut self, data: &[u8], limit: usize, buf: &mut [u8]) -> usize {
        let remaining = &data[self.position..];
        let count = remaining.len().min(buf.len()).min(limit);
        buf[..count].copy_from_slice(&remaining[..count]);
        self.position += count;
        count
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.clone() {
            Script::Reset => Err(ErrorKind::ConnectionReset.into()),
            Script::Stall => Err(ErrorKind::WouldBlock.into()),
            Script::Reply(data) => Ok(self.reply(&data, usize::MAX, buf)),
            Script::Trickle(data, _) if self.drained && self.position < data.len() => {
                self.drained = false;
                Err(ErrorKind::WouldBlock.into())
            }
            Script::Trickle(data, limit) => {
                self.drained = true;
                Ok(self.reply(&data, limit, buf))
            }
        }
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _: &Registry) -> io::Result<Connect> {
        Ok(Connect::Ready)
    }

    fn interest(&self, wanted: Interest) -> Interest {
        wanted
    }

    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        Ok(())
    }
}

/// Finished outputs by URL.
pub type Outputs = Rc<RefCell<Vec<(String, Vec<u8>)>>>;

/// Keeps finished outputs in memory.
#[derive(Default, Clone)]
pub struct MemorySinks {
    finished: Outputs,
}

impl MemorySinks {
    pub fn finished(&self) -> Vec<(String, Vec<u8>)> {
        self.finished.borrow().clone()
    }
}

impl SinkFactory for MemorySinks {
    fn open(&mut self, request: &OutputRequest) -> io::Result<Box<dyn Sink>> {
        Ok(Box::new(MemorySink {
            url: request.url.to_string(),
            data: Vec::new(),
            finished: self.finished.clone(),
        }))
    }
}

struct MemorySink {
    url: String,
    data: Vec<u8>,
    finished: Outputs,
}

impl Sink for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        let data = std::mem::take(&mut self.data);
        self.finished.borrow_mut().push((self.url.clone(), data));
        Ok(())
    }

    fn fail(&mut self, _: &FetchError) {
        self.data.clear();
    }
}
