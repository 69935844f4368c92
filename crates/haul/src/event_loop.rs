use std::time::{Duration, Instant};

use anyhow::{Context as _, Error};
use mio::{Events, Token};
use tracing::{event, instrument, Level};

use crate::{scheduler::index_for, Report, Session};

/// Readiness wait while jobs are still queued.
const BUSY_TICK: Duration = Duration::from_millis(250);

/// Readiness wait once everything has been admitted.
const IDLE_TICK: Duration = Duration::from_secs(1);

impl Session {
    /// Run until every job has finished or failed.
    ///
    /// Per-job failures end up in the report, only a failing poll aborts the run.
    #[instrument("Session::run", skip_all)]
    pub fn run(mut self) -> Result<Report, Error> {
        let mut events = Events::with_capacity(256);
        self.admit_next(Instant::now());

        while !self.pending.is_empty() || self.in_flight > 0 {
            let timeout = self.poll_timeout(Instant::now());

            let result = self.registry.poll(&mut events, Some(timeout));
            if let Err(error) = &result {
                event!(Level::ERROR, ?error, "poll failed");
            }
            result.context("failed to poll for readiness")?;

            let now = Instant::now();
            for event in events.iter() {
                // Errors and hangups surface through the next read or write
                let closed = event.is_error() || event.is_read_closed() || event.is_write_closed();
                let readable = event.is_readable() || closed;
                let writable = event.is_writable() || closed;

                self.dispatch(event.token(), readable, writable, now);
            }

            // Sweep on idle ticks, and at least once a tick while busy
            if events.is_empty() || now.saturating_duration_since(self.last_sweep) >= BUSY_TICK {
                self.evict_idle(now);
            }

            self.admit_next(now);
        }

        event!(
            Level::INFO,
            total = self.report.total,
            succeeded = self.report.succeeded,
            "session finished"
        );
        Ok(self.report)
    }

    /// Drive the connection behind `token` after a readiness event.
    pub(crate) fn dispatch(&mut self, token: Token, readable: bool, writable: bool, now: Instant) {
        let Some(index) = index_for(token) else {
            event!(Level::TRACE, ?token, "event for unknown token");
            return;
        };

        let (mut env, connections) = self.parts(now);
        let Some(connection) = connections.get_mut(index) else {
            event!(Level::TRACE, ?token, "event for retired connection");
            return;
        };

        event!(Level::TRACE, id = connection.id(), readable, writable, "ready");
        let outcome = connection.on_ready(&mut env);

        self.settle(index, outcome, now);
        self.admit_next(now);
    }

    /// How long the next readiness wait may block.
    fn poll_timeout(&self, now: Instant) -> Duration {
        let tick = if self.pending.is_empty() {
            IDLE_TICK
        } else {
            BUSY_TICK
        };

        // Wake up in time to evict the first connection that goes stale
        let timeout = self.config.read_timeout;
        self.connections
            .iter()
            .map(|(_, connection)| {
                (connection.last_access() + timeout).saturating_duration_since(now)
            })
            .min()
            .map_or(tick, |deadline| deadline.min(tick))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    use crate::{
        mock::{MemorySinks, MockConnector, Script},
        Job, SessionConfig,
    };

    use super::*;

    #[test]
    fn poll_timeout_shrinks_near_deadline() {
        let config = SessionConfig {
            read_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut session = Session::new(config, vec![Job::new("http://a.test/x")])
            .unwrap()
            .with_connector(Box::new(MockConnector::new(Script::Stall)))
            .with_sinks(Box::new(MemorySinks::default()));

        let now = Instant::now();
        assert_eq!(session.poll_timeout(now), BUSY_TICK);

        session.admit_next(now);
        assert!(session.poll_timeout(now) <= Duration::from_millis(100));
    }

    #[test]
    fn dispatch_delivers_body_to_sink() {
        let reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .to_vec();
        let sinks = MemorySinks::default();
        let mut session = Session::new(SessionConfig::default(), vec![Job::new("http://a.test/x")])
            .unwrap()
            .with_connector(Box::new(MockConnector::new(Script::Reply(reply))))
            .with_sinks(Box::new(sinks.clone()));

        let now = Instant::now();
        session.admit_next(now);
        let tokens: Vec<_> = session
            .connections
            .iter()
            .map(|(index, _)| crate::scheduler::token_for(index))
            .collect();
        session.dispatch(tokens[0], true, true, now);

        assert_eq!(session.in_flight, 0);
        assert_eq!(
            sinks.finished(),
            vec![("http://a.test/x".to_string(), b"hello world".to_vec())]
        );
    }

    #[test]
    fn trickled_gzip_chunked_body_arrives_intact() {
        let data = b"GIF89a and a long strip of picture data ".repeat(40);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut reply = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\
                          Content-Encoding: gzip\r\n\r\n"
            .to_vec();
        for chunk in compressed.chunks(50) {
            reply.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            reply.extend_from_slice(chunk);
            reply.extend_from_slice(b"\r\n");
        }
        reply.extend_from_slice(b"0\r\n\r\n");

        // Sizes that split the head, the chunk lines and the gzip header differently
        for limit in [1, 7, 64, 4096] {
            let sinks = MemorySinks::default();
            let script = Script::Trickle(reply.clone(), limit);
            let mut session =
                Session::new(SessionConfig::default(), vec![Job::new("http://a.test/x")])
                    .unwrap()
                    .with_connector(Box::new(MockConnector::new(script)))
                    .with_sinks(Box::new(sinks.clone()));

            let now = Instant::now();
            session.admit_next(now);
            let token = session
                .connections
                .iter()
                .map(|(index, _)| crate::scheduler::token_for(index))
                .next()
                .unwrap();

            let mut dispatches = 0;
            while session.in_flight > 0 && dispatches <= reply.len() {
                session.dispatch(token, true, true, now);
                dispatches += 1;
            }

            assert_eq!(session.in_flight, 0, "limit {}", limit);
            assert!(session.report.failures.is_empty(), "limit {}", limit);
            assert_eq!(
                sinks.finished(),
                vec![("http://a.test/x".to_string(), data.clone())],
                "limit {}",
                limit
            );
        }
    }
}
