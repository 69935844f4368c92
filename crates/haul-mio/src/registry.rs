use std::{io, time::Duration};

use mio::{event::Source, Events, Interest, Poll, Token};
use tracing::{event, Level};

/// Owner of the mio poll instance all transports register with.
pub struct Registry {
    poll: Poll,
}

impl Registry {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        Ok(Self { poll })
    }

    /// Wait for readiness events, at most `timeout`.
    ///
    /// An interrupted wait returns with no events.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {
                event!(Level::TRACE, "poll interrupted");
                events.clear();
                Ok(())
            }
            result => result,
        }
    }

    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }
}
