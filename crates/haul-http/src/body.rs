use thiserror::Error;
use tracing::{event, Level};

use crate::{ChunkError, ChunkedDecoder, Inflate, InflateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Incomplete,
    Complete,
}

/// How a reply body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body follows the head.
    Empty,
    Fixed(u64),
    UntilClose,
    Chunked,
}

/// Framing plus the content encoding stacked on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyPlan {
    pub framing: Framing,
    pub gzip: bool,
}

enum Frame {
    Empty,
    Fixed { remaining: u64 },
    UntilClose,
    Chunked(ChunkedDecoder),
}

/// Incremental decoder for one reply body.
///
/// Raw bytes are unframed first, then inflated if the body is gzip encoded. When inflating,
/// the end of the gzip stream completes the body even if framing says more should follow.
pub struct BodyDecoder {
    frame: Frame,
    inflate: Option<Inflate>,
    framed: Vec<u8>,
    complete: bool,
}

impl BodyDecoder {
    pub fn new(plan: BodyPlan) -> Self {
        let frame = match plan.framing {
            Framing::Empty => Frame::Empty,
            Framing::Fixed(remaining) => Frame::Fixed { remaining },
            Framing::UntilClose => Frame::UntilClose,
            Framing::Chunked => Frame::Chunked(ChunkedDecoder::default()),
        };

        Self {
            complete: matches!(frame, Frame::Empty),
            frame,
            inflate: plan.gzip.then(Inflate::default),
            framed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Decode bytes read from the peer, appending body content to `out`.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<Progress, DecodeError> {
        if self.complete {
            return Ok(Progress::Complete);
        }

        let framed_out = match self.inflate {
            Some(_) => &mut self.framed,
            None => &mut *out,
        };

        let framing = match &mut self.frame {
            Frame::Empty => Progress::Complete,
            Frame::Fixed { remaining } => {
                let take = (input.len() as u64).min(*remaining) as usize;
                framed_out.extend_from_slice(&input[..take]);
                *remaining -= take as u64;

                if *remaining == 0 {
                    Progress::Complete
                } else {
                    Progress::Incomplete
                }
            }
            Frame::UntilClose => {
                framed_out.extend_from_slice(input);
                Progress::Incomplete
            }
            Frame::Chunked(chunked) => chunked.decode(input, framed_out)?,
        };

        if let Some(inflate) = &mut self.inflate {
            let finished = inflate.inflate(&self.framed, out)?;
            self.framed.clear();

            if finished {
                if framing == Progress::Incomplete {
                    event!(Level::DEBUG, "gzip stream ended before framing, completing body");
                }
                self.complete = true;
                return Ok(Progress::Complete);
            }

            if framing == Progress::Complete {
                return Err(DecodeError::TruncatedGzip);
            }
        }

        self.complete = framing == Progress::Complete;
        Ok(framing)
    }

    /// Handle the peer closing the connection.
    ///
    /// Only a body read until close may end this way.
    pub fn decode_eof(&mut self) -> Result<Progress, DecodeError> {
        if self.complete {
            return Ok(Progress::Complete);
        }

        match (&self.frame, &self.inflate) {
            (Frame::UntilClose, None) => {}
            (Frame::UntilClose, Some(inflate)) if inflate.is_finished() => {}
            (Frame::UntilClose, Some(_)) => return Err(DecodeError::TruncatedGzip),
            _ => return Err(DecodeError::UnexpectedEof),
        }

        self.complete = true;
        Ok(Progress::Complete)
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Inflate(#[from] InflateError),
    #[error("connection closed before the body was complete")]
    UnexpectedEof,
    #[error("gzip stream truncated")]
    TruncatedGzip,
}
