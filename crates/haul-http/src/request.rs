use bytes::{BufMut, Bytes, BytesMut};

use crate::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    /// Only the reply head is wanted, a 200 completes with an empty body.
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
        }
    }
}

pub struct RequestOptions<'a> {
    pub method: Method,
    pub user_agent: &'a str,
    pub referer: Option<&'a str>,
    pub accept_gzip: bool,
    /// Send the full URL as request target, for relaying through a proxy.
    pub absolute_form: bool,
}

/// Serialize a single HTTP/1.1 request for `url`.
pub fn build_request(url: &Url, options: &RequestOptions) -> Bytes {
    let mut data = BytesMut::with_capacity(256);

    data.put(options.method.as_str().as_bytes());
    data.put_u8(b' ');
    if options.absolute_form {
        data.put(url.origin().as_bytes());
    }
    data.put(url.path().as_bytes());
    data.put(&b" HTTP/1.1\r\n"[..]);

    put_field(&mut data, "Host", &url.authority());
    put_field(&mut data, "User-Agent", options.user_agent);
    if options.accept_gzip {
        put_field(&mut data, "Accept-Encoding", "gzip");
    }
    if let Some(referer) = options.referer {
        put_field(&mut data, "Referer", referer);
    }

    data.put(&b"\r\n"[..]);
    data.freeze()
}

fn put_field(data: &mut BytesMut, key: &str, value: &str) {
    data.put(key.as_bytes());
    data.put(&b": "[..]);
    data.put(value.as_bytes());
    data.put(&b"\r\n"[..]);
}
