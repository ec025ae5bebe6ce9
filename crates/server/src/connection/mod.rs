//! Per-client connection state machine.
//!
//! A [`Connection`] owns the socket, its read and write buffers and the request in
//! flight. The event loop hands it readiness events; every callback makes as much
//! progress as the socket allows and returns. The loop then reconciles its registrations
//! with [`Connection::interest`] and the CGI session, if any.
//!
//! ```text
//! ReadingHeaders -> ReadingBody -> ReadyToDispatch -> SendingResponse -> ReadingHeaders
//!                                                  \-> CgiRunning -----/        |
//!                                                                               v
//!                                                                            Closed
//! ```

mod evaluate;

use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderValue, Method, StatusCode, Version, header};
use mio::Interest;
use mio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};
use webserv_http::codec::{HeaderDecoder, HeaderEncoder, MultipartStatus, MultipartStreamParser, PayloadDecoder, ResponseEncoder};
use webserv_http::protocol::{Message, PayloadItem, PayloadSize, RequestHeader, Response, ResponseHead, is_close_status};

use crate::cgi::{self, CgiRequest, CgiSession, OutputEvent, PAUSE_ABOVE, PipeEnd, RESUME_BELOW};
use crate::config::ServerConfig;
use crate::date::DateService;
use crate::error::CgiError;
use crate::handler::{self, RequestContext, UploadSink, UploadSummary, error_response};

pub use evaluate::{Dispatch, RequestPlan, evaluate};

/// Upper bound of bytes read from the socket in one callback.
const READ_BUDGET: usize = 256 * 1024;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReadingHeaders,
    ReadingBody,
    ReadyToDispatch,
    SendingResponse,
    CgiRunning,
    Closed,
}

/// The servers sharing one listening address.
///
/// The `Host` header picks among them; the first one configured is the default.
#[derive(Debug)]
pub struct VirtualHosts {
    default: Arc<ServerConfig>,
    named: Vec<Arc<ServerConfig>>,
}

impl VirtualHosts {
    pub fn new(default: Arc<ServerConfig>) -> Self {
        Self { default, named: Vec::new() }
    }

    pub fn push(&mut self, server: Arc<ServerConfig>) {
        self.named.push(server);
    }

    pub fn default_server(&self) -> &Arc<ServerConfig> {
        &self.default
    }

    /// The server for a request carrying `host`.
    pub fn select(&self, host: Option<&str>) -> &Arc<ServerConfig> {
        let Some(host) = host.map(cgi::strip_port) else {
            return &self.default;
        };

        if self.default.matches_host(host) {
            return &self.default;
        }
        self.named.iter().find(|server| server.matches_host(host)).unwrap_or(&self.default)
    }
}

/// The request being read or served.
#[derive(Debug)]
struct InFlight {
    header: RequestHeader,
    server: Arc<ServerConfig>,
    plan: RequestPlan,
    decoder: PayloadDecoder,
    body: BytesMut,
    upload: Option<MultipartUpload>,
    head_only: bool,
}

#[derive(Debug)]
struct MultipartUpload {
    parser: MultipartStreamParser,
    sink: UploadSink,
}

enum BodyProgress {
    Pending { progress: bool },
    Complete,
    Failed(StatusCode),
    PeerGone,
}

enum Outcome {
    Respond(Response),
    Cgi(CgiSession),
}

#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    hosts: Arc<VirtualHosts>,
    phase: Phase,
    read_buf: BytesMut,
    write_buf: BytesMut,
    encoder: ResponseEncoder,
    date: DateService,
    request: Option<InFlight>,
    cgi: Option<CgiSession>,
    retired: Vec<CgiSession>,
    close_after_write: bool,
    response_done: bool,
    peer_eof: bool,
    read_blocked: bool,
    last_activity: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr, hosts: Arc<VirtualHosts>, now: Instant) -> Self {
        Self {
            stream,
            peer,
            local,
            hosts,
            phase: Phase::ReadingHeaders,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            encoder: ResponseEncoder::new(),
            date: DateService::new(),
            request: None,
            cgi: None,
            retired: Vec::new(),
            close_after_write: false,
            response_done: false,
            peer_eof: false,
            read_blocked: false,
            last_activity: now,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Readiness the socket has to be registered for.
    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() { Interest::READABLE } else { Interest::READABLE | Interest::WRITABLE }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// The CGI session serving the current request.
    pub fn cgi_mut(&mut self) -> Option<&mut CgiSession> {
        self.cgi.as_mut()
    }

    /// Sessions that stopped serving a response and wait for their pipes to be
    /// deregistered and their child reaped.
    pub fn take_retired(&mut self) -> Vec<CgiSession> {
        mem::take(&mut self.retired)
    }

    pub fn on_socket_event(&mut self, readable: bool, now: Instant) {
        if readable {
            self.read_blocked = false;
        }
        self.advance(now);
    }

    pub fn on_pipe_event(&mut self, end: PipeEnd, now: Instant) {
        let Some(session) = self.cgi.as_mut() else {
            return;
        };

        match end {
            PipeEnd::Stdin => session.write_input(),
            PipeEnd::Stdout => self.pump_cgi(now),
        }

        if let Some(session) = self.cgi.as_mut() {
            session.try_reap();
        }
        self.advance(now);
    }

    /// Periodic check for expired timeouts.
    pub fn on_tick(&mut self, now: Instant) {
        if let Some(session) = self.cgi.as_mut() {
            session.try_reap();
            if session.is_timed_out(now) {
                self.fail_cgi(CgiError::Timeout, now);
                self.advance(now);
                return;
            }
        }

        let timeout = self.request.as_ref().map_or_else(|| self.hosts.default_server().client_timeout(), |request| request.server.client_timeout());
        if now.saturating_duration_since(self.last_activity) < timeout {
            return;
        }

        match self.phase {
            Phase::ReadingHeaders if self.read_buf.is_empty() => {
                debug!(peer = %self.peer, "closing idle connection");
                self.close();
            }
            Phase::ReadingHeaders | Phase::ReadingBody => {
                info!(peer = %self.peer, "request timed out");
                self.queue_error(StatusCode::REQUEST_TIMEOUT, now);
                self.advance(now);
            }
            Phase::SendingResponse => {
                debug!(peer = %self.peer, pending = self.write_buf.len(), "client stopped reading, closing");
                self.close();
            }
            Phase::ReadyToDispatch | Phase::CgiRunning | Phase::Closed => {}
        }
    }

    /// Makes progress until neither the socket nor the buffers allow more.
    fn advance(&mut self, now: Instant) {
        loop {
            let mut progress = false;

            if matches!(self.phase, Phase::ReadingHeaders | Phase::ReadingBody) {
                progress |= self.process_input(now);
            }
            if self.is_closed() {
                return;
            }

            progress |= self.flush(now);
            if self.is_closed() {
                return;
            }

            if let Some(session) = self.cgi.as_mut()
                && session.is_paused()
                && self.write_buf.len() < RESUME_BELOW
            {
                session.resume();
            }

            if self.phase == Phase::SendingResponse && self.response_done && self.write_buf.is_empty() {
                self.finish_request();
                if self.is_closed() {
                    return;
                }
                progress = true;
            }

            if matches!(self.phase, Phase::ReadingHeaders | Phase::ReadingBody) && !self.read_blocked && !self.peer_eof {
                progress |= self.read_socket(now);
                if self.is_closed() {
                    return;
                }
            }

            if !progress {
                return;
            }
        }
    }

    fn read_socket(&mut self, now: Instant) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        let mut read = 0;

        while read < READ_BUDGET {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.peer_eof = true;
                    return true;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&buf[..n]);
                    self.last_activity = now;
                    read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_blocked = true;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.peer, cause = %e, "read failed");
                    self.close();
                    return true;
                }
            }
        }

        read > 0
    }

    fn flush(&mut self, now: Instant) -> bool {
        let mut progress = false;

        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    self.close();
                    return true;
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                    self.last_activity = now;
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.peer, cause = %e, "write failed");
                    self.close();
                    return true;
                }
            }
        }

        progress
    }

    fn process_input(&mut self, now: Instant) -> bool {
        match self.phase {
            Phase::ReadingHeaders => self.read_headers(now),
            Phase::ReadingBody => self.read_body(now),
            _ => false,
        }
    }

    fn read_headers(&mut self, now: Instant) -> bool {
        match HeaderDecoder.decode(&mut self.read_buf) {
            Ok(Some(header)) => {
                self.last_activity = now;
                self.begin_request(header, now);
                true
            }
            Ok(None) => {
                if self.peer_eof {
                    if !self.read_buf.is_empty() {
                        debug!(peer = %self.peer, buffered = self.read_buf.len(), "client closed inside a request head");
                    }
                    self.close();
                    return true;
                }
                false
            }
            Err(e) => {
                info!(peer = %self.peer, cause = %e, "bad request head");
                self.queue_error(e.status_code(), now);
                true
            }
        }
    }

    fn begin_request(&mut self, header: RequestHeader, now: Instant) {
        let host = header.headers().get(header::HOST).and_then(|host| host.to_str().ok());
        let server = Arc::clone(self.hosts.select(host));
        let head_only = header.method() == Method::HEAD;

        debug!(peer = %self.peer, method = %header.method(), uri = %header.uri(), "request head received");

        match evaluate(&header, &server) {
            Ok(plan) => {
                let route = &server.routes[plan.route];
                let upload = plan.multipart.as_deref().map(|boundary| MultipartUpload {
                    parser: MultipartStreamParser::new(boundary),
                    sink: UploadSink::new(route.upload_dir.clone()),
                });
                let decoder = PayloadDecoder::from_payload_size(plan.payload_size, plan.max_body);

                self.request = Some(InFlight { header, server, plan, decoder, body: BytesMut::new(), upload, head_only });
                self.phase = Phase::ReadingBody;
            }
            Err(response) => {
                info!(peer = %self.peer, status = response.status().as_u16(), "request rejected");
                self.queue_head_response(response, head_only, now);
            }
        }
    }

    fn read_body(&mut self, now: Instant) -> bool {
        match self.decode_body() {
            BodyProgress::Pending { progress } => progress,
            BodyProgress::Complete => {
                self.phase = Phase::ReadyToDispatch;
                self.dispatch(now);
                true
            }
            BodyProgress::Failed(status) => {
                // dropping the sink removes what the upload wrote so far
                if let Some(request) = &mut self.request {
                    request.upload = None;
                }
                self.queue_error(status, now);
                true
            }
            BodyProgress::PeerGone => {
                debug!(peer = %self.peer, "client closed inside a request body");
                self.close();
                true
            }
        }
    }

    fn decode_body(&mut self) -> BodyProgress {
        let Some(request) = self.request.as_mut() else {
            return BodyProgress::Failed(StatusCode::INTERNAL_SERVER_ERROR);
        };
        let mut progress = false;

        loop {
            match request.decoder.decode(&mut self.read_buf) {
                Ok(Some(PayloadItem::Chunk(bytes))) => {
                    progress = true;
                    let Some(upload) = &mut request.upload else {
                        request.body.extend_from_slice(&bytes);
                        continue;
                    };

                    if upload.parser.feed(&bytes, &mut upload.sink) == MultipartStatus::Error {
                        if let Some(e) = upload.parser.error() {
                            info!(cause = %e, "malformed multipart body");
                        }
                        return BodyProgress::Failed(StatusCode::BAD_REQUEST);
                    }
                    if let Err(e) = upload.sink.checkpoint() {
                        return BodyProgress::Failed(e.status_code());
                    }
                }
                Ok(Some(PayloadItem::Eof)) => {
                    if matches!(request.plan.payload_size, PayloadSize::Length(_)) && !self.read_buf.is_empty() {
                        info!(surplus = self.read_buf.len(), "bytes beyond the declared content length");
                        return BodyProgress::Failed(StatusCode::BAD_REQUEST);
                    }
                    if let Some(upload) = &request.upload
                        && let Err(e) = upload.parser.finish()
                    {
                        info!(cause = %e, "incomplete multipart body");
                        return BodyProgress::Failed(StatusCode::BAD_REQUEST);
                    }
                    return BodyProgress::Complete;
                }
                Ok(None) if self.peer_eof => return BodyProgress::PeerGone,
                Ok(None) => return BodyProgress::Pending { progress },
                Err(e) => {
                    info!(cause = %e, "bad request body");
                    return BodyProgress::Failed(e.status_code());
                }
            }
        }
    }

    fn dispatch(&mut self, now: Instant) {
        let Some(mut request) = self.request.take() else {
            self.close();
            return;
        };

        let outcome = handle(&mut request, self.peer, self.local, now);
        self.request = Some(request);

        match outcome {
            Outcome::Respond(response) => self.queue_response(response, now),
            Outcome::Cgi(mut session) => {
                session.write_input();
                self.cgi = Some(session);
                self.phase = Phase::CgiRunning;
            }
        }
    }

    fn queue_error(&mut self, status: StatusCode, now: Instant) {
        let response = match &self.request {
            Some(request) => error_response(status, &request.server, Some(&request.server.routes[request.plan.route])),
            None => error_response(status, self.hosts.default_server(), None),
        };
        self.queue_response(response, now);
    }

    /// Queues a complete response for the request in flight.
    fn queue_response(&mut self, response: Response, now: Instant) {
        let head_only = self.request.as_ref().is_some_and(|request| request.head_only);
        self.queue_head_response(response, head_only, now);
    }

    fn queue_head_response(&mut self, response: Response, head_only: bool, now: Instant) {
        // an unread body would be parsed as the next request
        let body_unread = matches!(self.phase, Phase::ReadingHeaders | Phase::ReadingBody);
        let close = response.is_close() || is_close_status(response.status()) || body_unread || !self.keep_alive();

        let status = response.status();
        let (mut head, body) = response.into_parts();
        self.finalize_head(&mut head, close, now);

        let payload_size = if body.is_empty() { PayloadSize::Empty } else { PayloadSize::Length(body.len() as u64) };
        let result = if head_only {
            HeaderEncoder.encode((head, payload_size), &mut self.write_buf)
        } else {
            self.encode_buffered(head, payload_size, body)
        };

        debug!(peer = %self.peer, status = status.as_u16(), close, "response queued");

        if let Err(e) = result {
            warn!(peer = %self.peer, cause = %e, "failed to encode response");
            self.close();
            return;
        }

        self.response_done = true;
        self.phase = Phase::SendingResponse;
    }

    fn encode_buffered(&mut self, head: ResponseHead, payload_size: PayloadSize, body: Bytes) -> Result<(), webserv_http::protocol::SendError> {
        self.encoder.encode(Message::<_, Bytes>::Header((head, payload_size)), &mut self.write_buf)?;
        if !body.is_empty() {
            self.encoder.encode(Message::Payload(PayloadItem::Chunk(body)), &mut self.write_buf)?;
            self.encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), &mut self.write_buf)?;
        }
        Ok(())
    }

    fn keep_alive(&self) -> bool {
        !self.peer_eof && self.request.as_ref().is_some_and(|request| request.header.is_keep_alive())
    }

    /// Adds the headers every response carries and records whether to close.
    fn finalize_head(&mut self, head: &mut ResponseHead, close: bool, now: Instant) {
        let headers = head.headers_mut();
        headers.insert(header::SERVER, HeaderValue::from_static(crate::SERVER_SOFTWARE));
        headers.insert(header::DATE, self.date.http_date(now));

        if close {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
            self.close_after_write = true;
        } else if self.request.as_ref().is_some_and(|request| request.header.version() == Version::HTTP_10) {
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }
    }

    fn pump_cgi(&mut self, now: Instant) {
        let Some(session) = self.cgi.as_mut() else {
            return;
        };

        let budget = PAUSE_ABOVE.saturating_sub(self.write_buf.len());
        let mut events = Vec::new();
        let result = session.read_output(budget, &mut events);

        for event in events {
            self.on_cgi_output(event, now);
        }

        if let Err(e) = result {
            self.fail_cgi(e, now);
        }
    }

    fn on_cgi_output(&mut self, event: OutputEvent, now: Instant) {
        let head_only = self.request.as_ref().is_some_and(|request| request.head_only);

        let result = match event {
            OutputEvent::Head(mut head, payload_size) => {
                let close = payload_size.is_close_delimited() || !self.keep_alive();
                self.finalize_head(&mut head, close, now);
                debug!(peer = %self.peer, status = head.status().as_u16(), close, "cgi response head queued");

                if head_only {
                    HeaderEncoder.encode((head, payload_size), &mut self.write_buf)
                } else {
                    self.encoder.encode(Message::<_, Bytes>::Header((head, payload_size)), &mut self.write_buf)
                }
            }
            OutputEvent::Body(_) if head_only => Ok(()),
            OutputEvent::Body(bytes) => self.encoder.encode(Message::Payload(PayloadItem::Chunk(bytes)), &mut self.write_buf),
            OutputEvent::End => {
                let result = if self.encoder.is_in_payload() {
                    self.encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), &mut self.write_buf)
                } else {
                    Ok(())
                };
                self.retire_cgi();
                self.response_done = true;
                self.phase = Phase::SendingResponse;
                result
            }
        };

        if let Err(e) = result {
            warn!(peer = %self.peer, cause = %e, "failed to encode cgi response");
            self.close();
        }
    }

    /// Ends the CGI request after `e`: an error page when nothing was sent yet, else
    /// the connection closes once the queued bytes are flushed.
    fn fail_cgi(&mut self, e: CgiError, now: Instant) {
        let Some(session) = self.cgi.as_mut() else {
            return;
        };

        session.kill();
        let head_sent = session.is_head_parsed();
        warn!(peer = %self.peer, script = %session.script().display(), exit = ?session.exit_status(), cause = %e, "cgi request failed");
        self.retire_cgi();

        if head_sent {
            self.encoder.reset();
            self.close_after_write = true;
            self.response_done = true;
            self.phase = Phase::SendingResponse;
        } else {
            self.queue_error(e.status_code(), now);
        }
    }

    fn retire_cgi(&mut self) {
        if let Some(session) = self.cgi.take() {
            self.retired.push(session);
        }
    }

    /// Resets for the next request once a response was fully written.
    fn finish_request(&mut self) {
        self.request = None;
        self.response_done = false;
        self.encoder.reset();

        if self.close_after_write {
            self.close();
            return;
        }
        self.phase = Phase::ReadingHeaders;
    }

    fn close(&mut self) {
        if let Some(mut session) = self.cgi.take() {
            session.kill();
            self.retired.push(session);
        }
        self.phase = Phase::Closed;
    }
}

/// Runs the handler the plan of `request` names.
fn handle(request: &mut InFlight, peer: SocketAddr, local: SocketAddr, now: Instant) -> Outcome {
    let server = Arc::clone(&request.server);
    let route = &server.routes[request.plan.route];
    let path = request.plan.path.as_str();
    let context = RequestContext { header: &request.header, server: &server, route, path };

    let result = match request.plan.dispatch {
        Dispatch::Static => handler::serve(&context),
        Dispatch::Delete => handler::delete(&context),
        Dispatch::Upload => match request.upload.take() {
            Some(upload) => upload.sink.finish().map_err(|e| e.status_code()).and_then(created),
            None => match &route.upload_dir {
                Some(dir) => handler::save_raw(dir, path, &request.body)
                    .map_err(|e| {
                        warn!(cause = %e, "raw upload failed");
                        e.status_code()
                    })
                    .and_then(|file| created(UploadSummary { files: vec![file], fields: Vec::new() })),
                None => Err(StatusCode::NOT_FOUND),
            },
        },
        Dispatch::Cgi => {
            let body = request.body.split().freeze();
            match start_cgi(request, &server, body, peer, local, now) {
                Ok(session) => return Outcome::Cgi(session),
                Err(e) => {
                    warn!(peer = %peer, path, cause = %e, "cgi request refused");
                    Err(e.status_code())
                }
            }
        }
    };

    Outcome::Respond(result.unwrap_or_else(|status| error_response(status, &server, Some(route))))
}

fn start_cgi(request: &InFlight, server: &ServerConfig, body: Bytes, peer: SocketAddr, local: SocketAddr, now: Instant) -> Result<CgiSession, CgiError> {
    let route = &server.routes[request.plan.route];
    let script = cgi::resolve(server, route, &request.plan.path)?;
    let cgi_request = CgiRequest { header: &request.header, server, route, script: &script, body_len: body.len(), peer, local };
    cgi::spawn(&cgi_request, body, now)
}

fn created(summary: UploadSummary) -> handler::HandlerResult {
    Ok(Response::new(StatusCode::CREATED).with_body(mime::TEXT_PLAIN_UTF_8.as_ref(), summary.to_string()))
}
