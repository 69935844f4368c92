//! Incremental HTTP/1.x client wire handling.
//!
//! Nothing in this crate performs I/O. Every decoder accepts whatever slice of bytes the last
//! read produced and resumes from where the previous call stopped, so callers can feed it
//! straight from a non-blocking socket.

mod body;
mod chunked;
mod gzip;
mod reply;
mod request;
mod sniff;
mod url;

pub use self::{
    body::{BodyDecoder, BodyPlan, DecodeError, Framing, Progress},
    chunked::{ChunkError, ChunkedDecoder},
    gzip::{Inflate, InflateError},
    reply::{find_header_end, Disposition, HeaderField, ReplyError, ReplyHead, Version},
    request::{build_request, Method, RequestOptions},
    sniff::{image_extension, sniff_extension, SNIFF_LEN, UNKNOWN_EXTENSION},
    url::{Scheme, Url, UrlError},
};
