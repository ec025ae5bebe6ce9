//! The readiness loop driving every socket and pipe.
//!
//! One `mio::Poll` holds the listeners, the client sockets and the pipes of running CGI
//! children. The loop owns the token maps; after each callback it reconciles the
//! registrations of the client with what its [`Connection`] wants, so the readiness set
//! and the maps never drift apart.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::cgi::{CgiSession, PipeEnd};
use crate::config::Config;
use crate::connection::{Connection, VirtualHosts};
use crate::error::ServerError;

const WAKER: Token = Token(0);
/// Poll timeout, and so the granularity of every timeout the loop enforces.
const TICK: Duration = Duration::from_millis(100);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Listener {
    socket: TcpListener,
    hosts: Arc<VirtualHosts>,
}

/// Tokens of the pipes registered for a client's CGI session.
#[derive(Debug, Default)]
struct PipeTokens {
    stdin: Option<Token>,
    stdout: Option<Token>,
}

#[derive(Debug)]
struct Client {
    conn: Connection,
    interest: Interest,
    pipes: PipeTokens,
}

/// A child whose response is over but which has not exited yet.
#[derive(Debug)]
struct Zombie {
    child: Child,
    deadline: Instant,
    killed: bool,
}

/// Stops a running [`EventLoop`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.stop.store(true, Ordering::Release);
        self.waker.wake()
    }
}

#[derive(Debug)]
pub struct EventLoop {
    poll: Poll,
    listeners: BTreeMap<Token, Listener>,
    clients: HashMap<Token, Client>,
    /// pipe token -> owning client
    pipes: HashMap<Token, (Token, PipeEnd)>,
    reaper: Vec<Zombie>,
    next_token: usize,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl EventLoop {
    /// Binds one listener per distinct address of `config`.
    ///
    /// Servers configured on the same address share the listener and are told apart
    /// by the `Host` header.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let mut groups: Vec<(SocketAddr, VirtualHosts)> = Vec::new();
        for server in config.servers {
            let addr = server.listen_addr();
            let server = Arc::new(server);
            match groups.iter_mut().find(|(group_addr, _)| *group_addr == addr) {
                Some((_, hosts)) => hosts.push(server),
                None => groups.push((addr, VirtualHosts::new(server))),
            }
        }

        let mut listeners = BTreeMap::new();
        let mut next_token = WAKER.0 + 1;
        for (addr, hosts) in groups {
            let mut socket = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
            let token = Token(next_token);
            next_token += 1;

            poll.registry().register(&mut socket, token, Interest::READABLE)?;
            info!(addr = %socket.local_addr().unwrap_or(addr), "listening");
            listeners.insert(token, Listener { socket, hosts: Arc::new(hosts) });
        }

        Ok(Self {
            poll,
            listeners,
            clients: HashMap::new(),
            pipes: HashMap::new(),
            reaper: Vec::new(),
            next_token,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Addresses actually bound, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.values().filter_map(|listener| listener.socket.local_addr().ok()).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { waker: Arc::clone(&self.waker), stop: Arc::clone(&self.stop) }
    }

    /// Runs until a [`ShutdownHandle`] stops the loop.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut last_sweep = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(cause = %e, "poll failed");
                return Err(e.into());
            }

            let now = Instant::now();
            for event in &events {
                let token = event.token();
                if token == WAKER {
                    continue;
                }

                if self.listeners.contains_key(&token) {
                    self.accept(token, now);
                } else if let Some(&(client, end)) = self.pipes.get(&token) {
                    if let Some(entry) = self.clients.get_mut(&client) {
                        entry.conn.on_pipe_event(end, now);
                    }
                    self.sync(client);
                } else if let Some(entry) = self.clients.get_mut(&token) {
                    let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                    entry.conn.on_socket_event(readable, now);
                    self.sync(token);
                }
            }

            if now.saturating_duration_since(last_sweep) >= TICK {
                self.sweep(now);
                last_sweep = now;
            }
        }

        info!(clients = self.clients.len(), "event loop stopped");
        self.shutdown();
        Ok(())
    }

    fn accept(&mut self, token: Token, now: Instant) {
        let Some(listener) = self.listeners.get(&token) else {
            return;
        };

        loop {
            let (mut stream, peer) = match listener.socket.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(cause = %e, "failed to accept connection");
                    return;
                }
            };

            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    warn!(cause = %e, %peer, "dropping connection without local address");
                    continue;
                }
            };

            let client = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self.poll.registry().register(&mut stream, client, Interest::READABLE) {
                warn!(cause = %e, %peer, "failed to register connection");
                continue;
            }

            debug!(%peer, token = client.0, "accepted connection");
            let conn = Connection::new(stream, peer, local, Arc::clone(&listener.hosts), now);
            self.clients.insert(client, Client { conn, interest: Interest::READABLE, pipes: PipeTokens::default() });
        }
    }

    /// Brings the registrations of `token` in line with its connection.
    fn sync(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        let registry = self.poll.registry();

        for session in client.conn.take_retired() {
            release(registry, &mut self.pipes, &mut self.reaper, &mut client.pipes, session);
        }

        if client.conn.is_closed() {
            self.close_client(token);
            return;
        }

        if let Some(session) = client.conn.cgi_mut()
            && let Err(e) = sync_pipes(registry, &mut self.pipes, &mut self.next_token, token, &mut client.pipes, session)
        {
            error!(cause = %e, "failed to register cgi pipes");
            self.close_client(token);
            return;
        }

        let interest = client.conn.interest();
        if interest != client.interest {
            if let Err(e) = registry.reregister(client.conn.stream_mut(), token, interest) {
                warn!(cause = %e, "failed to update connection interest");
                self.close_client(token);
                return;
            }
            client.interest = interest;
        }
    }

    fn close_client(&mut self, token: Token) {
        let Some(mut client) = self.clients.remove(&token) else {
            return;
        };
        let registry = self.poll.registry();

        if let Some(session) = client.conn.cgi_mut() {
            session.kill();
        }
        for session in client.conn.take_retired() {
            release(registry, &mut self.pipes, &mut self.reaper, &mut client.pipes, session);
        }

        if let Err(e) = registry.deregister(client.conn.stream_mut()) {
            debug!(cause = %e, "failed to deregister connection");
        }
        debug!(peer = %client.conn.peer(), token = token.0, "connection closed");
    }

    /// Timeouts of every client, then the reaper.
    fn sweep(&mut self, now: Instant) {
        let tokens: Vec<Token> = self.clients.keys().copied().collect();
        for token in tokens {
            if let Some(client) = self.clients.get_mut(&token) {
                client.conn.on_tick(now);
            }
            self.sync(token);
        }

        self.reaper.retain_mut(|zombie| match zombie.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = zombie.child.id(), %status, "reaped cgi process");
                false
            }
            Ok(None) => {
                if !zombie.killed && now >= zombie.deadline {
                    warn!(pid = zombie.child.id(), "cgi process outlived its timeout, killing it");
                    if let Err(e) = zombie.child.kill() {
                        debug!(cause = %e, "failed to kill cgi process");
                    }
                    zombie.killed = true;
                }
                true
            }
            Err(e) => {
                warn!(cause = %e, "failed to wait for cgi process");
                false
            }
        });
    }

    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.clients.keys().copied().collect();
        for token in tokens {
            self.close_client(token);
        }

        for mut zombie in self.reaper.drain(..) {
            if let Err(e) = zombie.child.kill().and_then(|()| zombie.child.wait().map(drop)) {
                debug!(cause = %e, "failed to stop cgi process");
            }
        }
    }
}

fn next_token(next: &mut usize) -> Token {
    let token = Token(*next);
    *next += 1;
    token
}

fn deregister(registry: &Registry, source: &mut impl Source) {
    if let Err(e) = registry.deregister(source) {
        debug!(cause = %e, "failed to deregister pipe");
    }
}

/// Registers the pipes `session` still wants and closes the ones it is done with.
fn sync_pipes(
    registry: &Registry,
    pipes: &mut HashMap<Token, (Token, PipeEnd)>,
    next: &mut usize,
    client: Token,
    tokens: &mut PipeTokens,
    session: &mut CgiSession,
) -> io::Result<()> {
    if session.wants_stdin() {
        if tokens.stdin.is_none()
            && let Some(stdin) = session.stdin_mut()
        {
            let token = next_token(next);
            registry.register(stdin, token, Interest::WRITABLE)?;
            pipes.insert(token, (client, PipeEnd::Stdin));
            tokens.stdin = Some(token);
        }
    } else {
        if let Some(token) = tokens.stdin.take() {
            pipes.remove(&token);
            if let Some(stdin) = session.stdin_mut() {
                deregister(registry, stdin);
            }
        }
        session.close_stdin_if_done();
    }

    if session.wants_stdout() {
        if tokens.stdout.is_none()
            && let Some(stdout) = session.stdout_mut()
        {
            let token = next_token(next);
            registry.register(stdout, token, Interest::READABLE)?;
            pipes.insert(token, (client, PipeEnd::Stdout));
            tokens.stdout = Some(token);
        }
    } else {
        // a paused session keeps its pipe, it is registered again on resume
        if let Some(token) = tokens.stdout.take() {
            pipes.remove(&token);
            if let Some(stdout) = session.stdout_mut() {
                deregister(registry, stdout);
            }
        }
        session.close_stdout_if_done();
    }

    Ok(())
}

/// Drops the pipes of a finished session and hands its child to the reaper.
fn release(
    registry: &Registry,
    pipes: &mut HashMap<Token, (Token, PipeEnd)>,
    reaper: &mut Vec<Zombie>,
    tokens: &mut PipeTokens,
    mut session: CgiSession,
) {
    if let Some(token) = tokens.stdin.take() {
        pipes.remove(&token);
        if let Some(stdin) = session.stdin_mut() {
            deregister(registry, stdin);
        }
    }
    if let Some(token) = tokens.stdout.take() {
        pipes.remove(&token);
        if let Some(stdout) = session.stdout_mut() {
            deregister(registry, stdout);
        }
    }

    session.try_reap();
    if let Some(child) = session.take_child() {
        debug!(pid = child.id(), script = %session.script().display(), "cgi process handed to the reaper");
        reaper.push(Zombie { child, deadline: session.deadline(), killed: false });
    }
}
