//! One running CGI child and its two pipes.
//!
//! The session only performs non-blocking I/O on the pipes; registering them with the
//! readiness set is left to the event loop, which asks [`CgiSession::wants_stdin`] and
//! [`CgiSession::wants_stdout`] after every callback and closes pipe ends the session
//! has finished with.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::unix::pipe::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::cgi::env::{CgiRequest, build_env};
use crate::cgi::output::{OutputEvent, OutputParser};
use crate::cgi::resolve::Launcher;
use crate::error::CgiError;

/// Stop reading the child once this much response data waits for the client.
pub const PAUSE_ABOVE: usize = 1024 * 1024;
/// Resume reading once the client drained below this.
pub const RESUME_BELOW: usize = 512 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Which pipe a readiness event is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Stdin,
    Stdout,
}

#[derive(Debug)]
pub struct CgiSession {
    child: Option<Child>,
    stdin: Option<Sender>,
    stdout: Option<Receiver>,
    stdin_done: bool,
    stdout_done: bool,
    input: Bytes,
    written: usize,
    parser: OutputParser,
    started: Instant,
    timeout: Duration,
    paused: bool,
    exit_status: Option<ExitStatus>,
    script: PathBuf,
}

/// Starts the script of `request` with `body` as its standard input.
pub fn spawn(request: &CgiRequest<'_>, body: Bytes, now: Instant) -> Result<CgiSession, CgiError> {
    let script = request.script;

    let mut command = match &script.launcher {
        Launcher::Direct => Command::new(&script.path),
        Launcher::Interpreter { program, arg } => {
            let mut command = Command::new(program);
            command.args(arg.iter()).arg(&script.path);
            command
        }
    };

    command
        .current_dir(&script.working_dir)
        .env_clear()
        .envs(build_env(request))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = command.spawn().map_err(|source| CgiError::Spawn { source })?;

    let pipes = match open_pipes(&mut child) {
        Ok(pipes) => pipes,
        Err(source) => {
            // nothing was read or written yet, the kill is immediate
            if let Err(e) = child.kill().and_then(|()| child.wait().map(drop)) {
                warn!(cause = %e, "failed to kill cgi process");
            }
            return Err(CgiError::Spawn { source });
        }
    };

    info!(script = %script.path.display(), pid = child.id(), body = body.len(), "spawned cgi process");

    let (stdin, stdout) = pipes;
    let stdin_done = body.is_empty();
    Ok(CgiSession {
        child: Some(child),
        stdin: if stdin_done { None } else { Some(stdin) },
        stdout: Some(stdout),
        stdin_done,
        stdout_done: false,
        input: body,
        written: 0,
        parser: OutputParser::new(request.header.version(), request.route.cgi_max_output_bytes),
        started: now,
        timeout: request.route.cgi_timeout(),
        paused: false,
        exit_status: None,
        script: script.path.clone(),
    })
}

fn open_pipes(child: &mut Child) -> io::Result<(Sender, Receiver)> {
    let stdin = child.stdin.take().ok_or_else(|| io::Error::other("missing stdin pipe"))?;
    let stdout = child.stdout.take().ok_or_else(|| io::Error::other("missing stdout pipe"))?;

    let stdin = Sender::from(stdin);
    stdin.set_nonblocking(true)?;
    let stdout = Receiver::from(stdout);
    stdout.set_nonblocking(true)?;
    Ok((stdin, stdout))
}

impl CgiSession {
    /// Writes as much of the request body as the pipe takes.
    pub fn write_input(&mut self) {
        let Some(stdin) = &mut self.stdin else {
            return;
        };

        while self.written < self.input.len() {
            match stdin.write(&self.input[self.written..]) {
                Ok(0) => break,
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // the child stopped reading, typically EPIPE
                    debug!(cause = %e, written = self.written, "stopped feeding cgi stdin");
                    break;
                }
            }
        }

        self.stdin_done = true;
    }

    /// Reads output until the pipe would block, the child closed it, or `budget` body
    /// bytes were produced. Running out of budget pauses reading.
    pub fn read_output(&mut self, budget: usize, events: &mut Vec<OutputEvent>) -> Result<(), CgiError> {
        let mut produced = 0;
        let mut buf = [0u8; READ_CHUNK];

        while !self.stdout_done {
            if produced >= budget {
                self.paused = true;
                return Ok(());
            }

            let Some(stdout) = &mut self.stdout else {
                return Ok(());
            };

            match stdout.read(&mut buf) {
                Ok(0) => {
                    self.stdout_done = true;
                    self.try_reap();
                    return self.parser.finish(self.exit_status, events);
                }
                Ok(n) => {
                    let before = events.len();
                    if let Err(e) = self.parser.feed(&buf[..n], events) {
                        self.stdout_done = true;
                        return Err(e);
                    }
                    produced += events[before..]
                        .iter()
                        .map(|event| match event {
                            OutputEvent::Body(bytes) => bytes.len(),
                            _ => 0,
                        })
                        .sum::<usize>();

                    if self.parser.is_done() {
                        self.stdout_done = true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stdout_done = true;
                    return Err(CgiError::io(e));
                }
            }
        }

        Ok(())
    }

    /// Collects the exit status if the child already exited.
    pub fn try_reap(&mut self) {
        let Some(child) = &mut self.child else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(script = %self.script.display(), %status, "cgi process exited");
                self.exit_status = Some(status);
                self.child = None;
            }
            Ok(None) => {}
            Err(e) => warn!(cause = %e, "failed to poll cgi process"),
        }
    }

    /// Kills the child and stops all pipe I/O.
    pub fn kill(&mut self) {
        if let Some(child) = &mut self.child
            && let Err(e) = child.kill()
        {
            debug!(cause = %e, "failed to kill cgi process");
        }
        self.stdin_done = true;
        self.stdout_done = true;
        self.try_reap();
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// When the child is killed if it is still running.
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    pub fn is_head_parsed(&self) -> bool {
        self.parser.is_head_parsed()
    }

    /// No more output will be read.
    pub fn is_finished(&self) -> bool {
        self.stdout_done
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Whether stdin is open and still has to be registered for writability.
    pub fn wants_stdin(&self) -> bool {
        self.stdin.is_some() && !self.stdin_done
    }

    /// Whether stdout is open and should be registered for readability.
    pub fn wants_stdout(&self) -> bool {
        self.stdout.is_some() && !self.stdout_done && !self.paused
    }

    pub fn stdin_mut(&mut self) -> Option<&mut Sender> {
        self.stdin.as_mut()
    }

    pub fn stdout_mut(&mut self) -> Option<&mut Receiver> {
        self.stdout.as_mut()
    }

    /// Closes stdin once it is done, telling the child the body ended.
    pub fn close_stdin_if_done(&mut self) -> bool {
        if self.stdin_done && self.stdin.take().is_some() {
            debug!(written = self.written, "closed cgi stdin");
            return true;
        }
        false
    }

    pub fn close_stdout_if_done(&mut self) -> bool {
        self.stdout_done && self.stdout.take().is_some()
    }

    /// Hands out the child for reaping by the owner of the session.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

impl Drop for CgiSession {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            warn!(pid = child.id(), "dropping live cgi session, killing the child");
            if let Err(e) = child.kill() {
                debug!(cause = %e, "failed to kill cgi process");
            }
        }
    }
}
