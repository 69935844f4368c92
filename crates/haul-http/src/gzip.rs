use std::io::{self, BufRead, ErrorKind, Read};

use flate2::bufread::GzDecoder;
use thiserror::Error;
use tracing::{event, Level};

/// Output space handed to the decoder per read.
const OUTPUT_STEP: usize = 16 * 1024;

/// Streaming gzip inflater.
///
/// Compressed bytes are queued as they arrive and pulled through a `flate2` gzip decoder,
/// which parses the member header and checks the trailer. An empty queue reads as
/// `WouldBlock`, which the decoder treats as "come back with more input".
pub struct Inflate {
    decoder: GzDecoder<Queued>,
    finished: bool,
}

impl Default for Inflate {
    fn default() -> Self {
        Self {
            decoder: GzDecoder::new(Queued::default()),
            finished: false,
        }
    }
}

impl Inflate {
    /// Inflate `input`, appending everything it produces to `out`.
    ///
    /// Returns true once the gzip member has ended. Input past the end is ignored.
    pub fn inflate(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<bool, InflateError> {
        if self.finished {
            return Ok(true);
        }

        self.decoder.get_mut().push(input);

        let before = out.len();
        let mut step = [0; OUTPUT_STEP];
        loop {
            match self.decoder.read(&mut step) {
                Ok(0) => {
                    self.finished = true;
                    break;
                }
                Ok(read) => out.extend_from_slice(&step[..read]),
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => return Err(InflateError::Corrupt(error)),
            }
        }

        event!(
            Level::TRACE,
            consumed = input.len(),
            produced = out.len() - before,
            finished = self.finished,
            "inflated"
        );

        Ok(self.finished)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Compressed bytes not yet taken by the decoder.
#[derive(Default)]
struct Queued {
    data: Vec<u8>,
    position: usize,
}

impl Queued {
    fn push(&mut self, input: &[u8]) {
        if self.position == self.data.len() {
            self.data.clear();
            self.position = 0;
        }
        self.data.extend_from_slice(input);
    }
}

impl Read for Queued {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        self.consume(len);
        Ok(len)
    }
}

impl BufRead for Queued {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.position == self.data.len() {
            return Err(ErrorKind::WouldBlock.into());
        }

        Ok(&self.data[self.position..])
    }

    fn consume(&mut self, amt: usize) {
        self.position = (self.position + amt).min(self.data.len());
    }
}

#[derive(Error, Debug)]
pub enum InflateError {
    #[error("corrupt gzip stream")]
    Corrupt(#[source] io::Error),
}
