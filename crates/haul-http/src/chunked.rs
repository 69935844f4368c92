use thiserror::Error;
use tracing::{event, Level};

use crate::Progress;

/// Resumable decoder for `Transfer-Encoding: chunked` bodies.
///
/// Every byte of framing is consumed through an explicit sub-state, so a size line or CRLF
/// split over any number of reads picks up exactly where it stopped.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    size: u64,
    digits: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// CR ending the previous chunk's data. Not present before the first chunk.
    StartCr,
    StartLf,
    Digits,
    /// Optional spaces, then the CR ending the size line.
    EndCr,
    EndLf,
    Data,
    Complete,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Digits,
            size: 0,
            digits: 0,
        }
    }
}

impl ChunkedDecoder {
    /// Decode `input`, appending chunk data to `out`.
    ///
    /// Bytes after the terminating zero-size chunk are ignored.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<Progress, ChunkError> {
        let mut index = 0;

        while index < input.len() {
            let byte = input[index];

            match self.state {
                ChunkState::StartCr => {
                    expect(byte, b'\r', "CR after chunk")?;
                    self.state = ChunkState::StartLf;
                }
                ChunkState::StartLf => {
                    expect(byte, b'\n', "LF after chunk")?;
                    self.state = ChunkState::Digits;
                    self.size = 0;
                    self.digits = 0;
                }
                ChunkState::Digits => {
                    if let Some(digit) = hex_value(byte) {
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|size| size.checked_add(digit))
                            .ok_or(ChunkError::SizeOverflow)?;
                        self.digits += 1;
                    } else if self.digits == 0 {
                        return Err(ChunkError::UnexpectedByte {
                            byte,
                            expected: "chunk size",
                        });
                    } else {
                        // Not consumed, the size line continues in `EndCr`
                        self.state = ChunkState::EndCr;
                        continue;
                    }
                }
                ChunkState::EndCr => {
                    // Some servers pad the size with spaces
                    if byte != b' ' {
                        expect(byte, b'\r', "CR after chunk size")?;
                        self.state = ChunkState::EndLf;
                    }
                }
                ChunkState::EndLf => {
                    expect(byte, b'\n', "LF after chunk size")?;

                    if self.size == 0 {
                        event!(Level::TRACE, "last chunk");
                        self.state = ChunkState::Complete;
                        return Ok(Progress::Complete);
                    }

                    event!(Level::TRACE, size = self.size, "chunk");
                    self.state = ChunkState::Data;
                }
                ChunkState::Data => {
                    let available = (input.len() - index) as u64;
                    let take = available.min(self.size) as usize;

                    out.extend_from_slice(&input[index..index + take]);
                    self.size -= take as u64;
                    index += take;

                    if self.size == 0 {
                        self.state = ChunkState::StartCr;
                    }
                    continue;
                }
                ChunkState::Complete => return Ok(Progress::Complete),
            }

            index += 1;
        }

        if self.state == ChunkState::Complete {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Incomplete)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Complete
    }
}

fn expect(byte: u8, wanted: u8, expected: &'static str) -> Result<(), ChunkError> {
    if byte == wanted {
        Ok(())
    } else {
        Err(ChunkError::UnexpectedByte { byte, expected })
    }
}

fn hex_value(byte: u8) -> Option<u64> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as u64),
        b'a'..=b'f' => Some((byte - b'a' + 10) as u64),
        b'A'..=b'F' => Some((byte - b'A' + 10) as u64),
        _ => None,
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("bad chunk framing, expected {expected} but got {byte:#04x}")]
    UnexpectedByte { byte: u8, expected: &'static str },
    #[error("chunk size overflows")]
    SizeOverflow,
}
