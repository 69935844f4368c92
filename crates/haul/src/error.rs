use std::io;

use haul_http::{DecodeError, ReplyError, UrlError};
use thiserror::Error;

/// Why a job ended without its output.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("https through a proxy is not supported")]
    ProxyTls,
    #[error("failed to connect to {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to send request")]
    Write(#[source] io::Error),
    #[error("reply too long")]
    ReplyTooLong,
    #[error("connection closed before the reply head was complete")]
    UnexpectedEof,
    #[error(transparent)]
    Reply(#[from] ReplyError),
    #[error("bad redirect location")]
    Redirect(#[source] UrlError),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("read failed after {attempts} attempts")]
    Reset {
        attempts: usize,
        #[source]
        source: io::Error,
    },
    #[error("read timeout")]
    Timeout,
    #[error("failed to write output")]
    Output(#[source] io::Error),
    #[error("failed to use scratch page")]
    Scratch(#[source] io::Error),
    #[error("no match")]
    NoMatch,
    #[error("match has no group {0}")]
    MissingGroup(usize),
    #[error("bad matched url")]
    BadMatch(#[source] UrlError),
    #[error("failed to register with the poll registry")]
    Register(#[source] io::Error),
}

impl FetchError {
    /// The HTTP status the failure is about, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Reply(error) => error.status(),
            _ => None,
        }
    }
}
