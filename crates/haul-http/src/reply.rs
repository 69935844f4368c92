use bytes::{Buf, Bytes};
use thiserror::Error;
use tracing::{event, Level};

use crate::{BodyPlan, Framing, Method};

/// Find the end of the reply head.
///
/// Scans for `\n\r\n` and returns the offset just past it, where the body starts.
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(3)
        .position(|window| window == b"\n\r\n")
        .map(|index| index + 3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub key: Bytes,
    pub value: Bytes,
}

/// Status line and header fields of one reply.
#[derive(Debug)]
pub struct ReplyHead {
    pub version: Version,
    pub status: u16,
    pub fields: Vec<HeaderField>,
}

/// What the connection should do with a reply.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Body(BodyPlan),
    /// Follow the raw `Location` value.
    Redirect(String),
}

impl ReplyHead {
    /// Parse a complete reply head, as delimited by `find_header_end`.
    pub fn parse(data: &[u8]) -> Result<Self, ReplyError> {
        let mut data = Bytes::copy_from_slice(data);
        let status_line = take_line(&mut data).ok_or(ReplyError::BadStatusLine)?;

        let version = if status_line.starts_with(b"HTTP/1.1 ") {
            Version::Http11
        } else if status_line.starts_with(b"HTTP/1.0 ") {
            Version::Http10
        } else {
            return Err(ReplyError::BadStatusLine);
        };

        let digits = status_line[9..]
            .iter()
            .take_while(|byte| byte.is_ascii_digit())
            .count();
        let status = std::str::from_utf8(&status_line[9..9 + digits])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or(ReplyError::BadStatusLine)?;

        let mut fields = Vec::new();
        while let Some(line) = take_line(&mut data) {
            // Empty line terminates the head
            if line.is_empty() {
                break;
            }

            match parse_field(line) {
                Some(field) => fields.push(field),
                None => event!(Level::TRACE, "skipping malformed header line"),
            }
        }

        Ok(Self {
            version,
            status,
            fields,
        })
    }

    /// Value of the first field named `key`, compared case-insensitively.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.key.eq_ignore_ascii_case(key.as_bytes()))
            .and_then(|field| std::str::from_utf8(&field.value).ok())
    }

    /// Decide what a client sent `method` should do next.
    pub fn classify(&self, method: Method) -> Result<Disposition, ReplyError> {
        match self.status {
            200 => self.body_plan(method).map(Disposition::Body),
            301 | 302 => {
                let location = self
                    .field("Location")
                    .filter(|location| !location.is_empty())
                    .ok_or(ReplyError::RedirectWithoutLocation(self.status))?;
                Ok(Disposition::Redirect(location.to_string()))
            }
            status => Err(ReplyError::Status(status)),
        }
    }

    fn body_plan(&self, method: Method) -> Result<BodyPlan, ReplyError> {
        let gzip = match self.field("Content-Encoding") {
            Some(value) if value.eq_ignore_ascii_case("gzip") => true,
            Some(value) if value.eq_ignore_ascii_case("x-gzip") => true,
            Some(value) if value.eq_ignore_ascii_case("identity") => false,
            Some(value) => {
                event!(Level::WARN, encoding = value, "unsupported content encoding, saving as is");
                false
            }
            None => false,
        };

        if method == Method::Head {
            return Ok(BodyPlan {
                framing: Framing::Empty,
                gzip: false,
            });
        }

        let chunked = match self.field("Transfer-Encoding") {
            Some(value) => {
                let chunked = value.to_ascii_lowercase().contains("chunked");
                if !chunked {
                    event!(Level::WARN, encoding = value, "unexpected transfer encoding");
                }
                chunked
            }
            None => false,
        };

        let framing = if chunked {
            Framing::Chunked
        } else {
            match self.field("Content-Length") {
                Some(value) => match value.parse::<u64>() {
                    Ok(0) => Framing::Empty,
                    Ok(length) => Framing::Fixed(length),
                    Err(_) => return Err(ReplyError::BadContentLength(value.to_string())),
                },
                None => Framing::UntilClose,
            }
        };

        Ok(BodyPlan { framing, gzip })
    }
}

/// Split off the next line, without its CRLF or bare LF.
fn take_line(data: &mut Bytes) -> Option<Bytes> {
    if data.is_empty() {
        return None;
    }

    let end = data
        .iter()
        .position(|byte| *byte == b'\n')
        .unwrap_or(data.len());
    let mut line = data.split_to(end);
    if data.has_remaining() {
        data.advance(1);
    }

    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }

    Some(line)
}

fn parse_field(line: Bytes) -> Option<HeaderField> {
    let split = line.iter().position(|byte| *byte == b':')?;

    let mut value = line.clone();
    let key = value.split_to(split);
    value.advance(1);

    Some(HeaderField {
        key: trim(key),
        value: trim(value),
    })
}

fn trim(mut bytes: Bytes) -> Bytes {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes.advance(start);

    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(0, |index| index + 1);
    bytes.truncate(end);

    bytes
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("bad status line")]
    BadStatusLine,
    #[error("status {0}")]
    Status(u16),
    #[error("status {0} with no new location")]
    RedirectWithoutLocation(u16),
    #[error("bad content length \"{0}\"")]
    BadContentLength(String),
}

impl ReplyError {
    /// The HTTP status the failure is about, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ReplyError::Status(status) | ReplyError::RedirectWithoutLocation(status) => {
                Some(*status)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_head(data: &[u8]) -> ReplyHead {
        let end = find_header_end(data).unwrap();
        ReplyHead::parse(&data[..end]).unwrap()
    }

    #[test]
    fn header_end_found_after_blank_line() {
        let data = b"HTTP/1.1 200 OK\r\nA: b\r\n\r\nbody";
        assert_eq!(find_header_end(data), Some(data.len() - 4));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\nA: b\r\n"), None);
    }

    #[test]
    fn fixed_length_plan() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\ncontent-length:  12 \r\nX-Other: y\r\n\r\n");

        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.field("Content-Length"), Some("12"));
        assert_eq!(head.field("x-other"), Some("y"));
        assert_eq!(
            head.classify(Method::Get),
            Ok(Disposition::Body(BodyPlan {
                framing: Framing::Fixed(12),
                gzip: false
            }))
        );
    }

    #[test]
    fn chunked_wins_over_length_and_gzip_detected() {
        let head = parse_head(
            b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\
              Content-Encoding: gzip\r\n\r\n",
        );

        assert_eq!(
            head.classify(Method::Get),
            Ok(Disposition::Body(BodyPlan {
                framing: Framing::Chunked,
                gzip: true
            }))
        );
    }

    #[test]
    fn missing_length_reads_until_close() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n");

        assert_eq!(
            head.classify(Method::Get),
            Ok(Disposition::Body(BodyPlan {
                framing: Framing::UntilClose,
                gzip: false
            }))
        );
    }

    #[test]
    fn head_request_has_no_body() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n");

        assert_eq!(
            head.classify(Method::Head),
            Ok(Disposition::Body(BodyPlan {
                framing: Framing::Empty,
                gzip: false
            }))
        );
    }

    #[test]
    fn redirect_location() {
        let head = parse_head(b"HTTP/1.1 302 Found\r\nLocation:   /img/a.png  \r\n\r\n");
        assert_eq!(
            head.classify(Method::Get),
            Ok(Disposition::Redirect("/img/a.png".into()))
        );

        let head = parse_head(b"HTTP/1.1 301 Moved\r\nServer: x\r\n\r\n");
        let error = head.classify(Method::Get).unwrap_err();
        assert_eq!(error, ReplyError::RedirectWithoutLocation(301));
        assert_eq!(error.status(), Some(301));
    }

    #[test]
    fn other_status_fails() {
        let head = parse_head(b"HTTP/1.1 404 Not Found\r\n\r\n");
        assert_eq!(head.classify(Method::Get), Err(ReplyError::Status(404)));
    }

    #[test]
    fn bad_status_line() {
        assert_eq!(
            ReplyHead::parse(b"HTTP/2 200\r\n\r\n").unwrap_err(),
            ReplyError::BadStatusLine
        );
        assert_eq!(
            ReplyHead::parse(b"HTTP/1.1 abc\r\n\r\n").unwrap_err(),
            ReplyError::BadStatusLine
        );
    }
}
