use std::{
    io::{self, ErrorKind},
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use haul_http::{
    build_request, find_header_end, BodyDecoder, Disposition, Method, Progress, ReplyHead,
    RequestOptions, Scheme, Url,
};
use haul_mio::{check_io, Connect, Connector, Endpoint, Registry, TlsMode, Transport};
use mio::{Interest, Token};
use tracing::{event, Level};

use crate::{
    extract::{resolve, ScratchFile},
    sink::{OutputRequest, Sink, SinkFactory},
    Extract, FetchError, Job, SessionConfig,
};

/// Session state a connection needs while it is being driven.
pub(crate) struct Env<'a> {
    pub config: &'a SessionConfig,
    pub registry: &'a Registry,
    pub connector: &'a mut dyn Connector,
    pub sinks: &'a mut dyn SinkFactory,
    /// Process-wide count of connections that were reset at least once.
    pub resets: &'a mut usize,
    pub now: Instant,
}

/// Result of driving a connection.
#[derive(Debug)]
pub(crate) enum Step {
    /// Waiting for readiness.
    Pending,
    Done,
    /// The page matched, fetch this URL next.
    Matched(Url),
}

enum State {
    Connecting,
    SendingRequest,
    ReceivingHeaders,
    ReceivingBody(BodyDecoder),
    ExtractingRegex,
    Done,
    Failed,
}

/// Whether to keep driving without waiting for readiness.
enum Flow {
    Continue,
    Wait,
    Finish(Step),
}

enum Output {
    Sink(Box<dyn Sink>),
    Scrape { page: ScratchFile, extract: Extract },
}

/// One in-flight fetch, from connect to done.
///
/// The transport is present exactly while the connection is connecting, sending, or receiving.
/// `on_ready` takes it out for the duration of a step and hands it back or closes it after.
pub(crate) struct Connection {
    id: u64,
    job: Rc<Job>,
    url: Url,
    /// Fetching the target extracted from a page, rather than the job's own URL.
    matched: bool,
    state: State,
    transport: Option<Box<dyn Transport>>,
    token: Token,
    interest: Option<Interest>,

    request: Bytes,
    written: usize,
    buffer: Vec<u8>,
    filled: usize,
    decoded: Vec<u8>,
    output: Option<Output>,

    retries: usize,
    reset_counted: bool,
    redirects: usize,
    last_access: Instant,
}

impl Connection {
    pub fn new(
        id: u64,
        job: Rc<Job>,
        url: Url,
        matched: bool,
        config: &SessionConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            job,
            url,
            matched,
            state: State::Connecting,
            transport: None,
            token: Token(0),
            interest: None,

            request: Bytes::new(),
            written: 0,
            buffer: vec![0; config.buffer_size.max(1)],
            filled: 0,
            decoded: Vec::new(),
            output: None,

            retries: 0,
            reset_counted: false,
            redirects: 0,
            last_access: now,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job(&self) -> &Rc<Job> {
        &self.job
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > timeout
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// The extraction rule, while the page itself is being fetched.
    fn scrape_rule(&self) -> Option<&Extract> {
        if self.matched {
            None
        } else {
            self.job.extract.as_ref()
        }
    }

    fn method(&self, config: &SessionConfig) -> Method {
        // Pages are always read in full
        if self.scrape_rule().is_some() {
            Method::Get
        } else {
            config.method
        }
    }

    fn endpoint(&self, config: &SessionConfig) -> Result<Endpoint, FetchError> {
        let tls = match self.url.scheme() {
            Scheme::Http => None,
            Scheme::Https if self.job.insecure => Some(TlsMode::Insecure),
            Scheme::Https => Some(TlsMode::Verified),
        };

        match &config.proxy {
            Some(_) if tls.is_some() => Err(FetchError::ProxyTls),
            Some(proxy) => Ok(Endpoint {
                host: proxy.host.clone(),
                port: proxy.port,
                tls: None,
            }),
            None => Ok(Endpoint {
                host: self.url.host().to_string(),
                port: self.url.port(),
                tls,
            }),
        }
    }

    /// Open a transport and queue the request for the current URL.
    pub fn start(&mut self, env: &mut Env) -> Result<(), FetchError> {
        let endpoint = self.endpoint(env.config)?;

        event!(Level::DEBUG, id = self.id, url = %self.url, "connecting");
        let mut transport = env
            .connector
            .connect(&endpoint)
            .map_err(|source| FetchError::Connect {
                endpoint: format!("{}:{}", endpoint.host, endpoint.port),
                source,
            })?;

        let options = RequestOptions {
            method: self.method(env.config),
            user_agent: &env.config.user_agent,
            referer: self.job.referer.as_deref(),
            accept_gzip: env.config.accept_gzip,
            absolute_form: env.config.proxy.is_some(),
        };
        self.request = build_request(&self.url, &options);
        self.written = 0;
        self.filled = 0;

        // Register for the connect completion
        let interest = transport.interest(Interest::WRITABLE);
        transport
            .register(env.registry, self.token, interest)
            .map_err(FetchError::Register)?;

        self.transport = Some(transport);
        self.interest = Some(interest);
        self.state = State::Connecting;
        self.last_access = env.now;

        Ok(())
    }

    /// Drive the connection as far as it goes without blocking.
    pub fn on_ready(&mut self, env: &mut Env) -> Result<Step, FetchError> {
        self.last_access = env.now;

        let Some(mut transport) = self.transport.take() else {
            event!(Level::TRACE, id = self.id, "ready without a transport");
            return Ok(Step::Pending);
        };

        let result = self.drive(env, transport.as_mut());

        // Keep the transport while it is still needed, failures included so `fail` closes it
        if self.transport.is_none() && (self.is_live() || result.is_err()) {
            self.transport = Some(transport);
        } else {
            close(self.id, transport, env.registry);
        }

        result
    }

    fn drive(&mut self, env: &mut Env, transport: &mut dyn Transport) -> Result<Step, FetchError> {
        loop {
            let flow = match self.state {
                State::Connecting => self.drive_connect(transport, env.registry)?,
                State::SendingRequest => self.send_request(transport)?,
                State::ReceivingHeaders | State::ReceivingBody(_) => self.receive(env, transport)?,
                State::ExtractingRegex | State::Done | State::Failed => Flow::Finish(Step::Pending),
            };

            // A redirect or retry has moved on to a fresh transport, which registered itself
            if self.transport.is_some() {
                return Ok(Step::Pending);
            }

            match flow {
                Flow::Continue => continue,
                Flow::Wait => {
                    self.update_interest(transport, env.registry)?;
                    return Ok(Step::Pending);
                }
                Flow::Finish(step) => return Ok(step),
            }
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            State::Connecting
                | State::SendingRequest
                | State::ReceivingHeaders
                | State::ReceivingBody(_)
        )
    }

    fn drive_connect(
        &mut self,
        transport: &mut dyn Transport,
        registry: &Registry,
    ) -> Result<Flow, FetchError> {
        match transport.connect(registry) {
            Ok(Connect::Ready) => {
                event!(Level::DEBUG, id = self.id, "connected");
                self.state = State::SendingRequest;
                Ok(Flow::Continue)
            }
            Ok(Connect::Pending) => Ok(Flow::Wait),
            Err(source) => Err(FetchError::Connect {
                endpoint: self.url.authority(),
                source,
            }),
        }
    }

    fn send_request(&mut self, transport: &mut dyn Transport) -> Result<Flow, FetchError> {
        while self.written < self.request.len() {
            match check_io(transport.write(&self.request[self.written..])) {
                Ok(Some(0)) => return Err(FetchError::Write(ErrorKind::WriteZero.into())),
                Ok(Some(count)) => {
                    event!(Level::TRACE, id = self.id, count, "sent");
                    self.written += count;
                }
                Ok(None) => return Ok(Flow::Wait),
                Err(error) => return Err(FetchError::Write(error)),
            }
        }

        self.state = State::ReceivingHeaders;
        Ok(Flow::Continue)
    }

    fn update_interest(
        &mut self,
        transport: &mut dyn Transport,
        registry: &Registry,
    ) -> Result<(), FetchError> {
        let wanted = match self.state {
            State::Connecting | State::SendingRequest => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        let interest = transport.interest(wanted);

        if self.interest != Some(interest) {
            event!(Level::TRACE, id = self.id, ?interest, "interest changed");
            transport
                .reregister(registry, self.token, interest)
                .map_err(FetchError::Register)?;
            self.interest = Some(interest);
        }

        Ok(())
    }

    fn receive(&mut self, env: &mut Env, transport: &mut dyn Transport) -> Result<Flow, FetchError> {
        // Finish writing anything a TLS session still holds
        check_io(transport.flush()).map_err(FetchError::Write)?;

        loop {
            let start = match self.state {
                State::ReceivingHeaders => self.filled,
                _ => 0,
            };
            if start == self.buffer.len() {
                return Err(FetchError::ReplyTooLong);
            }

            let result = check_io(transport.read(&mut self.buffer[start..]));

            let flow = match result {
                Ok(Some(0)) => self.on_eof(env)?,
                Ok(Some(count)) => {
                    event!(Level::TRACE, id = self.id, count, "received");
                    self.on_bytes(env, count)?
                }
                Ok(None) => Flow::Wait,
                Err(error) => self.reset(env, error)?,
            };

            match flow {
                // Keep reading until the socket would block
                Flow::Continue if self.is_live() && self.transport.is_none() => continue,
                flow => return Ok(flow),
            }
        }
    }

    fn on_bytes(&mut self, env: &mut Env, count: usize) -> Result<Flow, FetchError> {
        let progress = match &mut self.state {
            State::ReceivingBody(decoder) => {
                decoder.decode(&self.buffer[..count], &mut self.decoded)?
            }
            _ => return self.on_header_bytes(env, count),
        };

        self.after_decode(env, progress)
    }

    fn on_header_bytes(&mut self, env: &mut Env, count: usize) -> Result<Flow, FetchError> {
        self.filled += count;

        let Some(end) = find_header_end(&self.buffer[..self.filled]) else {
            if self.filled == self.buffer.len() {
                return Err(FetchError::ReplyTooLong);
            }
            return Ok(Flow::Continue);
        };

        let head = ReplyHead::parse(&self.buffer[..end])?;
        event!(Level::DEBUG, id = self.id, status = head.status, "reply");

        match head.classify(self.method(env.config))? {
            Disposition::Redirect(location) => self.redirect(env, head.status, &location),
            Disposition::Body(plan) => {
                self.open_output(env)?;

                // Body bytes that arrived with the head
                let mut decoder = BodyDecoder::new(plan);
                let progress = decoder.decode(&self.buffer[end..self.filled], &mut self.decoded)?;
                self.state = State::ReceivingBody(decoder);

                self.after_decode(env, progress)
            }
        }
    }

    fn after_decode(&mut self, env: &mut Env, progress: Progress) -> Result<Flow, FetchError> {
        self.deliver()?;

        match progress {
            Progress::Complete => self.complete(env),
            Progress::Incomplete => Ok(Flow::Continue),
        }
    }

    fn on_eof(&mut self, env: &mut Env) -> Result<Flow, FetchError> {
        let progress = match &mut self.state {
            State::ReceivingBody(decoder) => decoder.decode_eof()?,
            _ => return Err(FetchError::UnexpectedEof),
        };

        match progress {
            Progress::Complete => self.complete(env),
            Progress::Incomplete => Err(FetchError::UnexpectedEof),
        }
    }

    fn open_output(&mut self, env: &mut Env) -> Result<(), FetchError> {
        if let Some(extract) = self.scrape_rule() {
            let extract = extract.clone();
            let page = ScratchFile::create(&env.config.scratch_dir, self.id)
                .map_err(FetchError::Scratch)?;
            self.output = Some(Output::Scrape { page, extract });
            return Ok(());
        }

        // Link checks only need the status
        if self.method(env.config) == Method::Head {
            return Ok(());
        }

        let request = OutputRequest {
            id: self.id,
            url: &self.url,
            name: self.job.output.as_deref(),
        };
        let sink = env.sinks.open(&request).map_err(FetchError::Output)?;
        self.output = Some(Output::Sink(sink));

        Ok(())
    }

    /// Hand decoded bytes to the output.
    fn deliver(&mut self) -> Result<(), FetchError> {
        if self.decoded.is_empty() {
            return Ok(());
        }

        let result = match &mut self.output {
            Some(Output::Sink(sink)) => sink.write(&self.decoded).map_err(FetchError::Output),
            Some(Output::Scrape { page, .. }) => {
                page.write(&self.decoded).map_err(FetchError::Scratch)
            }
            None => Ok(()),
        };
        self.decoded.clear();

        result
    }

    fn complete(&mut self, env: &mut Env) -> Result<Flow, FetchError> {
        match self.output.take() {
            Some(Output::Scrape { page, extract }) => {
                self.state = State::ExtractingRegex;
                self.extract(env, page, &extract).map(Flow::Finish)
            }
            Some(Output::Sink(mut sink)) => {
                sink.finish().map_err(FetchError::Output)?;
                self.state = State::Done;
                Ok(Flow::Finish(Step::Done))
            }
            None => {
                self.state = State::Done;
                Ok(Flow::Finish(Step::Done))
            }
        }
    }

    fn extract(
        &mut self,
        env: &mut Env,
        mut page: ScratchFile,
        rule: &Extract,
    ) -> Result<Step, FetchError> {
        let found = page.find_match(rule);
        page.dispose(env.config.keep_scratch);

        let reference = found?;
        let url = resolve(&self.url, self.job.base_href.as_deref(), &reference)
            .map_err(FetchError::BadMatch)?;

        event!(Level::DEBUG, id = self.id, %url, "matched");
        self.state = State::Done;
        Ok(Step::Matched(url))
    }

    fn redirect(&mut self, env: &mut Env, status: u16, location: &str) -> Result<Flow, FetchError> {
        self.redirects += 1;
        if self.redirects > env.config.max_redirects {
            return Err(FetchError::TooManyRedirects);
        }

        let url = self.url.resolve(location).map_err(FetchError::Redirect)?;
        if self.job.redirect_ok {
            event!(Level::DEBUG, id = self.id, status, from = %self.url, to = %url, "redirect");
        } else {
            event!(Level::WARN, id = self.id, status, from = %self.url, to = %url, "redirect");
        }

        // Same connection, new socket
        self.url = url;
        self.start(env)?;

        Ok(Flow::Wait)
    }

    /// Retry after a read error, or fail once out of retries.
    fn reset(&mut self, env: &mut Env, error: io::Error) -> Result<Flow, FetchError> {
        self.retries += 1;
        if !self.reset_counted {
            self.reset_counted = true;
            *env.resets += 1;
        }

        let reason = FetchError::Reset {
            attempts: self.retries,
            source: error,
        };
        if self.retries > env.config.max_retries {
            return Err(reason);
        }

        event!(Level::WARN, id = self.id, url = %self.url, attempt = self.retries, "reset, retrying");
        self.discard_output(&reason, env.config.keep_scratch);
        self.start(env)?;

        Ok(Flow::Wait)
    }

    /// Close the transport.
    ///
    /// Returns false if it was already closed, which is harmless.
    pub fn release(&mut self, registry: &Registry) -> bool {
        let Some(transport) = self.transport.take() else {
            event!(Level::DEBUG, id = self.id, url = %self.url, "multiple closes");
            return false;
        };

        close(self.id, transport, registry);
        self.interest = None;

        true
    }

    /// Give up on the connection, discarding partial output.
    pub fn fail(&mut self, registry: &Registry, reason: &FetchError, keep_scratch: bool) {
        if self.is_connected() {
            self.release(registry);
        }

        self.discard_output(reason, keep_scratch);
        self.state = State::Failed;
    }

    fn discard_output(&mut self, reason: &FetchError, keep_scratch: bool) {
        match self.output.take() {
            Some(Output::Sink(mut sink)) => sink.fail(reason),
            Some(Output::Scrape { page, .. }) => page.dispose(keep_scratch),
            None => {}
        }
    }
}

fn close(id: u64, mut transport: Box<dyn Transport>, registry: &Registry) {
    if let Err(error) = transport.deregister(registry) {
        event!(Level::DEBUG, id, ?error, "deregister failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Proxy;

    fn connection(url: &str, insecure: bool) -> Connection {
        let job = Job::new(url).with_insecure(insecure);
        let url = Url::parse(url).unwrap();

        Connection::new(1, Rc::new(job), url, false, &SessionConfig::default(), Instant::now())
    }

    fn proxied() -> SessionConfig {
        SessionConfig {
            proxy: Some(Proxy {
                host: "proxy.test".into(),
                port: 3128,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn endpoint_picks_tls_mode() {
        let config = SessionConfig::default();

        let endpoint = connection("https://a.test/x", false).endpoint(&config).unwrap();
        assert_eq!(endpoint.host, "a.test");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.tls, Some(TlsMode::Verified));

        let endpoint = connection("https://a.test/x", true).endpoint(&config).unwrap();
        assert_eq!(endpoint.tls, Some(TlsMode::Insecure));

        let endpoint = connection("http://a.test:8080/x", false).endpoint(&config).unwrap();
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.tls, None);
    }

    #[test]
    fn proxy_relays_plain_http() {
        let endpoint = connection("http://a.test/x", false)
            .endpoint(&proxied())
            .unwrap();

        assert_eq!(endpoint.host, "proxy.test");
        assert_eq!(endpoint.port, 3128);
        assert_eq!(endpoint.tls, None);
    }

    #[test]
    fn proxy_refuses_https() {
        let result = connection("https://a.test/x", false).endpoint(&proxied());

        assert!(matches!(result, Err(FetchError::ProxyTls)));
    }
}
