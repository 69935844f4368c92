use std::{path::PathBuf, time::Duration};

use haul_http::Method;
use thiserror::Error;

/// Options for one session run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connections open at once. Clamped to the job count.
    pub concurrency: usize,
    /// Connections idle for longer than this fail.
    pub read_timeout: Duration,
    /// Resets tolerated per connection before it fails.
    pub max_retries: usize,
    pub max_redirects: usize,
    /// Per-connection read buffer, also the limit on a reply head.
    pub buffer_size: usize,
    pub user_agent: String,
    pub accept_gzip: bool,
    pub method: Method,
    pub proxy: Option<Proxy>,
    /// Shuffle the jobs once before starting.
    pub randomize: bool,
    /// Record resolved target URLs instead of downloading them.
    pub links_only: bool,
    /// Keep two-stage pages after extraction.
    pub keep_scratch: bool,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            read_timeout: Duration::from_secs(120),
            max_retries: 2,
            max_redirects: 10,
            buffer_size: 64 * 1024,
            user_agent: concat!("haul/", env!("CARGO_PKG_VERSION")).to_string(),
            accept_gzip: true,
            method: Method::Get,
            proxy: None,
            randomize: false,
            links_only: false,
            keep_scratch: false,
            output_dir: PathBuf::from("."),
            scratch_dir: PathBuf::from("."),
        }
    }
}

/// A plain HTTP relay proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
}

impl Proxy {
    pub const DEFAULT_PORT: u16 = 3128;

    /// Parse `host[:port]`, with or without a leading `http://`.
    pub fn parse(value: &str) -> Result<Self, ProxyError> {
        let value = value.trim();
        let value = value.strip_prefix("http://").unwrap_or(value);
        let value = value.trim_end_matches('/');

        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ProxyError::BadPort(port.to_string()))?;
                (host, port)
            }
            None => (value, Self::DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(ProxyError::MissingHost);
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProxyError {
    #[error("proxy has no host")]
    MissingHost,
    #[error("bad proxy port \"{0}\"")]
    BadPort(String),
}
