use std::path::PathBuf;

use clap::Parser;

/// Fetch a batch of URLs concurrently.
///
/// With `--regex`, each URL is a page that gets scanned for the real target,
/// which is then fetched in turn.
#[derive(Parser, Debug)]
#[command(name = "haul", version, about)]
pub struct Args {
    /// URLs to fetch
    pub urls: Vec<String>,

    /// Read jobs from a file, one `url [output-name]` per line
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Directory outputs are written to
    #[arg(short = 'd', long, default_value = ".")]
    pub dir: PathBuf,

    /// Directory two-stage pages are written to, defaults to the output directory
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Keep two-stage pages after extraction
    #[arg(short = 'k', long)]
    pub keep: bool,

    /// Record resolved URLs to this file instead of downloading them
    #[arg(short = 'l', long)]
    pub links_only: Option<PathBuf>,

    /// Relay plain HTTP through `host[:port]`
    #[arg(short = 'p', long, env = "HAUL_PROXY")]
    pub proxy: Option<String>,

    /// Shuffle the jobs before starting
    #[arg(short = 'r', long)]
    pub randomize: bool,

    /// Connections open at once
    #[arg(short = 't', long, default_value_t = 100)]
    pub threads: usize,

    /// Seconds a connection may sit idle
    #[arg(short = 'T', long, default_value_t = 120)]
    pub timeout: u64,

    /// Resets tolerated per connection
    #[arg(long, default_value_t = 2)]
    pub retries: usize,

    /// Only check that URLs exist
    #[arg(long)]
    pub head: bool,

    /// Scan each page for this pattern and fetch what it captures
    #[arg(long)]
    pub regex: Option<String>,

    /// Capture group holding the target URL
    #[arg(long, default_value_t = 1)]
    pub group: usize,

    /// Referer to send, `url` sends each job's own URL
    #[arg(long)]
    pub referer: Option<String>,

    /// Prefix for relative references found by `--regex`
    #[arg(long)]
    pub base_href: Option<String>,

    /// Don't log redirects as warnings
    #[arg(long)]
    pub redirect_ok: bool,

    /// Accept any TLS certificate
    #[arg(long)]
    pub insecure: bool,

    /// Don't ask for gzip encoded replies
    #[arg(long)]
    pub no_gzip: bool,

    /// Increase output verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
