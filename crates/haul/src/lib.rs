//! Bounded-concurrency batch downloader.
//!
//! A `Session` fetches a list of jobs over plain HTTP/1.x connections driven by one readiness
//! loop, never holding more than the configured number of connections open at once. Jobs with
//! an `Extract` rule first fetch a page, then fetch whatever URL the rule finds in it.

mod config;
mod connection;
mod error;
mod event_loop;
mod extract;
mod job;
#[cfg(test)]
mod mock;
mod report;
mod scheduler;
mod sink;

use anyhow::Error;

pub use haul_http::Method;

pub use self::{
    config::{Proxy, ProxyError, SessionConfig},
    error::FetchError,
    job::{Extract, Job, JobError},
    report::{Failure, Report},
    scheduler::Session,
    sink::{FileSink, FileSinks, OutputRequest, Sink, SinkFactory},
};

/// Fetch every job with default transports and file outputs.
pub fn run(config: SessionConfig, jobs: Vec<Job>) -> Result<Report, Error> {
    Session::new(config, jobs)?.run()
}
