use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// An absolute `http` or `https` URL with a host, fragment removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    inner: ::url::Url,
    scheme: Scheme,
}

impl Url {
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(UrlError::Empty);
        }

        Self::from_url(::url::Url::parse(input)?)
    }

    fn from_url(mut inner: ::url::Url) -> Result<Self, UrlError> {
        let scheme = match inner.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        };

        if inner.host_str().map_or(true, str::is_empty) {
            return Err(UrlError::MissingHost(inner.to_string()));
        }

        // Fragments never go on the wire
        inner.set_fragment(None);

        Ok(Self { inner, scheme })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or address, IPv6 addresses without brackets.
    pub fn host(&self) -> &str {
        let host = self.inner.host_str().unwrap_or_default();
        host.strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(host)
    }

    pub fn port(&self) -> u16 {
        self.inner
            .port_or_known_default()
            .unwrap_or_else(|| self.scheme.default_port())
    }

    /// Path and query, as sent in the request line.
    pub fn path(&self) -> &str {
        &self.inner[::url::Position::BeforePath..::url::Position::AfterQuery]
    }

    /// Host with the port appended when it isn't the scheme default, as sent in `Host`.
    pub fn authority(&self) -> String {
        let host = self.inner.host_str().unwrap_or_default();

        match self.inner.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// `scheme://authority` without a trailing slash.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }

    /// The last non-empty path segment.
    pub fn file_name(&self) -> Option<&str> {
        self.inner
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
    }

    /// Resolve a reference found in a `Location` header or a scraped page against this URL.
    pub fn resolve(&self, reference: &str) -> Result<Url, UrlError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(UrlError::Empty);
        }

        Self::from_url(self.inner.join(reference)?)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error("empty url")]
    Empty,
    #[error(transparent)]
    Parse(#[from] ::url::ParseError),
    #[error("only http and https are supported, not \"{0}\"")]
    UnsupportedScheme(String),
    #[error("no host in \"{0}\"")]
    MissingHost(String),
}
