use std::{collections::VecDeque, rc::Rc, time::Instant};

use anyhow::{bail, Context as _, Error};
use haul_http::Url;
use haul_mio::{Connector, NetConnector, Registry};
use mio::Token;
use rand::{seq::SliceRandom, thread_rng};
use thunderdome::{Arena, Index};
use tracing::{event, Level};

use crate::{
    connection::{Connection, Env, Step},
    sink::{FileSinks, SinkFactory},
    Failure, FetchError, Job, Report, SessionConfig,
};

/// One batch run: the pending queue, the live connections, and their totals.
///
/// Admission happens here, the event loop driving the connections is in `event_loop`.
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) registry: Registry,
    pub(crate) connector: Box<dyn Connector>,
    pub(crate) sinks: Box<dyn SinkFactory>,

    pub(crate) pending: VecDeque<Rc<Job>>,
    pub(crate) connections: Arena<Connection>,
    /// Admission limit, the configured concurrency clamped to the job count.
    pub(crate) limit: usize,
    pub(crate) in_flight: usize,
    next_id: u64,
    pub(crate) last_sweep: Instant,

    pub(crate) report: Report,
}

impl Session {
    pub fn new(config: SessionConfig, jobs: Vec<Job>) -> Result<Self, Error> {
        if config.concurrency == 0 {
            bail!("concurrency limit must be at least 1");
        }

        let registry = Registry::new().context("failed to create poll registry")?;

        // Shuffle once, before anything is admitted
        let mut jobs: Vec<_> = jobs.into_iter().map(Rc::new).collect();
        if config.randomize {
            jobs.shuffle(&mut thread_rng());
        }

        let limit = config.concurrency.min(jobs.len());
        let sinks = Box::new(FileSinks::new(config.output_dir.clone()));
        event!(Level::DEBUG, jobs = jobs.len(), limit, "session created");

        Ok(Self {
            config,
            registry,
            connector: Box::new(NetConnector::default()),
            sinks,

            pending: jobs.into(),
            connections: Arena::new(),
            limit,
            in_flight: 0,
            next_id: 0,
            last_sweep: Instant::now(),

            report: Report::default(),
        })
    }

    /// Replace how transports are opened.
    pub fn with_connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace where outputs go.
    pub fn with_sinks(mut self, sinks: Box<dyn SinkFactory>) -> Self {
        self.sinks = sinks;
        self
    }

    pub(crate) fn parts(&mut self, now: Instant) -> (Env<'_>, &mut Arena<Connection>) {
        let env = Env {
            config: &self.config,
            registry: &self.registry,
            connector: self.connector.as_mut(),
            sinks: self.sinks.as_mut(),
            resets: &mut self.report.resets,
            now,
        };

        (env, &mut self.connections)
    }

    /// Admit pending jobs while there is capacity.
    ///
    /// Returns whether jobs are still waiting.
    pub(crate) fn admit_next(&mut self, now: Instant) -> bool {
        while self.in_flight < self.limit {
            let Some(job) = self.pending.pop_front() else {
                break;
            };

            self.admit(job, now);
        }

        !self.pending.is_empty()
    }

    fn admit(&mut self, job: Rc<Job>, now: Instant) {
        self.report.total += 1;
        event!(Level::INFO, url = %job.url, "starting");

        let url = match Url::parse(&job.url) {
            Ok(url) => url,
            Err(error) => {
                self.record_failure(&job, job.url.clone(), error.into());
                return;
            }
        };

        // Nothing to fetch, the URL itself is the link
        if self.config.links_only && job.extract.is_none() {
            event!(Level::DEBUG, %url, "recording link");
            self.report.links.push(url.to_string());
            self.report.succeeded += 1;
            return;
        }

        self.open(job, url, false, now);
    }

    /// A two-stage page matched, fetch its target in the slot the page just freed.
    fn derive(&mut self, job: Rc<Job>, url: Url, now: Instant) {
        self.report.total += 1;
        event!(Level::INFO, %url, "starting matched");

        self.open(job, url, true, now);
    }

    fn open(&mut self, job: Rc<Job>, url: Url, matched: bool, now: Instant) {
        self.next_id += 1;
        let connection = Connection::new(self.next_id, job, url, matched, &self.config, now);

        let index = self.connections.insert(connection);
        self.in_flight += 1;
        self.report.peak_in_flight = self.report.peak_in_flight.max(self.in_flight);

        let (mut env, connections) = self.parts(now);
        let Some(connection) = connections.get_mut(index) else {
            return;
        };
        connection.set_token(token_for(index));

        if let Err(error) = connection.start(&mut env) {
            self.settle(index, Err(error), now);
        }
    }

    /// Retire a connection that finished or failed.
    ///
    /// Settling an already retired connection only logs.
    pub(crate) fn settle(&mut self, index: Index, outcome: Result<Step, FetchError>, now: Instant) {
        if matches!(outcome, Ok(Step::Pending)) {
            return;
        }

        let Some(mut connection) = self.connections.remove(index) else {
            event!(Level::DEBUG, ?index, "multiple closes");
            return;
        };
        self.in_flight -= 1;

        match outcome {
            Ok(Step::Pending) => {}
            Ok(Step::Done) => {
                event!(Level::INFO, id = connection.id(), url = %connection.url(), "finished");
                self.report.succeeded += 1;
            }
            Ok(Step::Matched(url)) => {
                self.report.succeeded += 1;

                if self.config.links_only {
                    event!(Level::DEBUG, %url, "recording link");
                    self.report.links.push(url.to_string());
                } else {
                    self.derive(connection.job().clone(), url, now);
                }
            }
            Err(reason) => {
                connection.fail(&self.registry, &reason, self.config.keep_scratch);
                let url = connection.url().to_string();
                self.record_failure(connection.job(), url, reason);
            }
        }
    }

    fn record_failure(&mut self, job: &Job, url: String, reason: FetchError) {
        event!(Level::ERROR, url = %url, %reason, "failed");

        self.report.failures.push(Failure {
            url,
            output: job.output.clone(),
            reason,
        });
    }

    /// Fail every connection idle for longer than the read timeout.
    pub(crate) fn evict_idle(&mut self, now: Instant) {
        let timeout = self.config.read_timeout;
        let stale: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.is_stale(now, timeout))
            .map(|(index, _)| index)
            .collect();

        for index in stale {
            event!(Level::WARN, ?index, "timed out");
            self.settle(index, Err(FetchError::Timeout), now);
        }

        self.last_sweep = now;
    }
}

pub(crate) fn token_for(index: Index) -> Token {
    Token(index.to_bits() as usize)
}

pub(crate) fn index_for(token: Token) -> Option<Index> {
    Index::from_bits(token.0 as u64)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::mock::{MemorySinks, MockConnector, Script};

    fn session(config: SessionConfig, urls: &[&str], script: Script) -> (Session, MockConnector) {
        let jobs = urls.iter().map(|url| Job::new(*url)).collect();
        let connector = MockConnector::new(script);

        let session = Session::new(config, jobs)
            .unwrap()
            .with_connector(Box::new(connector.clone()))
            .with_sinks(Box::new(MemorySinks::default()));

        (session, connector)
    }

    fn live_tokens(session: &Session) -> Vec<Token> {
        session
            .connections
            .iter()
            .map(|(index, _)| token_for(index))
            .collect()
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = SessionConfig {
            concurrency: 0,
            ..Default::default()
        };

        assert!(Session::new(config, vec![Job::new("http://example.com/")]).is_err());
    }

    #[test]
    #[traced_test]
    fn admission_bounded_by_limit() {
        let config = SessionConfig {
            concurrency: 2,
            ..Default::default()
        };
        let urls = ["http://a.test/1", "http://a.test/2", "http://a.test/3", "http://a.test/4"];
        let (mut session, connector) = session(config, &urls, Script::Stall);

        let waiting = session.admit_next(Instant::now());

        assert!(waiting);
        assert_eq!(session.in_flight, 2);
        assert_eq!(session.pending.len(), 2);
        assert_eq!(connector.opened(), 2);
    }

    #[test]
    fn limit_clamped_to_job_count() {
        let (session, _) = session(
            SessionConfig::default(),
            &["http://a.test/1", "http://a.test/2"],
            Script::Stall,
        );

        assert_eq!(session.limit, 2);
    }

    #[test]
    #[traced_test]
    fn admission_failures_continue_to_next_job() {
        let config = SessionConfig {
            concurrency: 1,
            ..Default::default()
        };
        let urls = ["ftp://a.test/1", "http://unresolvable/2", "http://a.test/3"];
        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let (mut session, _) = session(config, &urls, Script::Reply(reply));

        let now = Instant::now();
        session.admit_next(now);

        assert_eq!(session.report.failures.len(), 2);
        assert_eq!(session.in_flight, 1);

        for token in live_tokens(&session) {
            session.dispatch(token, true, true, now);
        }

        assert_eq!(session.in_flight, 0);
        assert_eq!(session.report.succeeded, 1);
        assert_eq!(session.report.total, 3);
    }

    #[test]
    #[traced_test]
    fn reset_every_attempt_fails_after_retry_limit() {
        let config = SessionConfig {
            max_retries: 2,
            ..Default::default()
        };
        let (mut session, connector) = session(config, &["http://a.test/reset"], Script::Reset);

        let now = Instant::now();
        session.admit_next(now);
        let tokens = live_tokens(&session);

        // Each dispatch runs one attempt into the reset
        for _ in 0..3 {
            session.dispatch(tokens[0], true, true, now);
        }

        assert_eq!(connector.opened(), 3);
        assert_eq!(session.report.resets, 1);
        assert_eq!(session.in_flight, 0);
        assert_eq!(session.report.failures.len(), 1);
        assert!(matches!(
            session.report.failures[0].reason,
            FetchError::Reset { attempts: 3, .. }
        ));
        assert!(logs_contain("reset, retrying"));
    }

    #[test]
    #[traced_test]
    fn shuffle_admits_every_job_once() {
        let config = SessionConfig {
            randomize: true,
            ..Default::default()
        };
        let urls: Vec<String> = (0..20).map(|i| format!("http://a.test/{}", i)).collect();
        let urls: Vec<&str> = urls.iter().map(String::as_str).collect();
        let (mut session, connector) = session(config, &urls, Script::Stall);

        let mut sorted = urls.clone();
        sorted.sort_unstable();

        let mut queued: Vec<_> = session.pending.iter().map(|job| job.url.clone()).collect();
        queued.sort_unstable();
        assert_eq!(queued, sorted);

        let now = Instant::now();
        session.admit_next(now);
        session.admit_next(now);

        let mut admitted: Vec<_> = session
            .connections
            .iter()
            .map(|(_, connection)| connection.job().url.clone())
            .collect();
        admitted.sort_unstable();

        assert_eq!(admitted, sorted);
        assert_eq!(connector.opened(), urls.len());
        assert_eq!(session.report.total, urls.len());
        assert!(session.pending.is_empty());
    }

    #[test]
    #[traced_test]
    fn redirect_loop_fails_after_limit() {
        let config = SessionConfig {
            max_redirects: 3,
            ..Default::default()
        };
        let reply = b"HTTP/1.1 302 Found\r\nLocation: /loop\r\n\r\n".to_vec();
        let (mut session, connector) = session(config, &["http://a.test/loop"], Script::Reply(reply));

        let now = Instant::now();
        session.admit_next(now);
        let tokens = live_tokens(&session);

        // Every reply is answered on a fresh transport until the limit
        for _ in 0..4 {
            session.dispatch(tokens[0], true, true, now);
        }

        assert_eq!(connector.opened(), 4);
        assert_eq!(session.in_flight, 0);
        assert_eq!(session.report.failures.len(), 1);
        assert!(matches!(
            session.report.failures[0].reason,
            FetchError::TooManyRedirects
        ));
        assert!(logs_contain("redirect"));
    }

    #[test]
    #[traced_test]
    fn idle_connection_times_out() {
        let config = SessionConfig {
            read_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let (mut session, _) = session(config, &["http://a.test/slow"], Script::Stall);

        let start = Instant::now();
        session.admit_next(start);
        let tokens = live_tokens(&session);
        session.dispatch(tokens[0], true, false, start);

        // Not stale yet
        session.evict_idle(start + Duration::from_millis(500));
        assert_eq!(session.in_flight, 1);

        session.evict_idle(start + Duration::from_secs(2));
        assert_eq!(session.in_flight, 0);
        assert!(matches!(
            session.report.failures[0].reason,
            FetchError::Timeout
        ));

        // A late readiness event for the evicted connection is ignored
        session.dispatch(tokens[0], true, true, start + Duration::from_secs(3));
        assert_eq!(session.report.failures.len(), 1);
        assert_eq!(session.report.succeeded, 0);
    }

    #[test]
    #[traced_test]
    fn release_and_settle_are_idempotent() {
        let (mut session, _) = session(
            SessionConfig::default(),
            &["http://a.test/a", "http://a.test/b"],
            Script::Stall,
        );

        let now = Instant::now();
        session.admit_next(now);
        let index = session
            .connections
            .iter()
            .map(|(index, _)| index)
            .next()
            .unwrap();

        let registry = &session.registry;
        let connection = session.connections.get_mut(index).unwrap();
        assert!(connection.release(registry));
        assert!(!connection.release(registry));

        session.settle(index, Err(FetchError::Timeout), now);
        session.settle(index, Err(FetchError::Timeout), now);

        assert_eq!(session.in_flight, 1);
        assert_eq!(session.report.failures.len(), 1);
        assert!(logs_contain("multiple closes"));
    }

    #[test]
    fn token_round_trip() {
        let mut arena = Arena::new();
        arena.insert(());
        let index = arena.insert(());

        assert_eq!(index_for(token_for(index)), Some(index));
    }
}
