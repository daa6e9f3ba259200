//! One control client: buffered non-blocking I/O, request framing,
//! and (for TCP) the authentication handshake.

use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::control::{
    handshake,
    protocol::{ControlCommand, CtrlCommandError, EOT, MAX_LINE_LEN, MAX_PENDING_OUTPUT},
};

/// Executes commands arriving on the control channel. Returning a
/// `CtrlCommandError` reports its message to the client, any other
/// error (or a panic) is reported as a generic failure.
pub trait CommandHandler {
    fn handle(&mut self, cmd: &ControlCommand, out: &mut String) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub enum CtrlStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl CtrlStream {
    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            CtrlStream::Unix(s) => s.set_nonblocking(nonblocking),
            CtrlStream::Tcp(s) => s.set_nonblocking(nonblocking),
        }
    }
}

impl Read for CtrlStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CtrlStream::Unix(s) => s.read(buf),
            CtrlStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for CtrlStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CtrlStream::Unix(s) => s.write(buf),
            CtrlStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CtrlStream::Unix(s) => s.flush(),
            CtrlStream::Tcp(s) => s.flush(),
        }
    }
}

impl AsRawFd for CtrlStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            CtrlStream::Unix(s) => s.as_raw_fd(),
            CtrlStream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

#[derive(Debug)]
enum Auth {
    Open,
    AwaitComponent {
        secret: Arc<str>,
    },
    AwaitResponse {
        secret: Arc<str>,
        challenge: String,
        component: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    Closed,
}

/// What executing one request line produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Reply text without the EOT; `None` for `exit`.
    pub reply: Option<String>,
    pub close: bool,
}

/// Run one (authenticated) request line through `handler`.
pub fn execute_line(line: &str, handler: &mut dyn CommandHandler) -> Execution {
    let Some(cmd) = ControlCommand::parse(line) else {
        return Execution {
            reply: Some("empty command received\n".into()),
            close: false,
        };
    };
    if cmd.name == "exit" {
        return Execution {
            reply: None,
            close: true,
        };
    }
    let mut out = String::new();
    let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&cmd, &mut out)));
    let reply = match result {
        Ok(Ok(())) => out,
        Ok(Err(e)) => match e.downcast_ref::<CtrlCommandError>() {
            Some(CtrlCommandError(msg)) => format!("error: {msg}\n"),
            None => {
                warn!("control command {:?} failed: {e:#}", cmd.name);
                "error: failed to execute command\n".into()
            }
        },
        Err(_) => {
            warn!("control command {:?} panicked", cmd.name);
            "error: failed to execute command\n".into()
        }
    };
    // With `!`, the reply still ends in EOT before the close.
    Execution {
        reply: Some(reply),
        close: cmd.close_after,
    }
}

#[derive(Debug)]
pub struct ControlConnection {
    stream: CtrlStream,
    peer: String,
    input: Vec<u8>,
    output: Vec<u8>,
    auth: Auth,
    /// Close once `output` is flushed.
    closing: bool,
    eof: bool,
}

impl ControlConnection {
    /// `secret` set means the client has to authenticate first.
    pub fn new(
        stream: CtrlStream,
        peer: String,
        secret: Option<Arc<str>>,
    ) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        let auth = match secret {
            Some(secret) => Auth::AwaitComponent { secret },
            None => Auth::Open,
        };
        Ok(ControlConnection {
            stream,
            peer,
            input: Vec::new(),
            output: Vec::new(),
            auth,
            closing: false,
            eof: false,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn reply(&mut self, text: &str) {
        self.output.extend_from_slice(text.as_bytes());
        self.output.push(EOT);
    }

    /// Read what is available, but stop once more than a maximal
    /// line is buffered. Returns false on a hard error.
    fn fill_input(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        while self.input.len() <= MAX_LINE_LEN {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return true;
                }
                Ok(n) => self.input.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    debug!("control connection {}: read error: {e}", self.peer);
                    return false;
                }
            }
        }
        true
    }

    fn is_backlogged(&self) -> bool {
        self.output.len() >= MAX_PENDING_OUTPUT
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.input.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.input.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]);
        Some(line.trim_end_matches('\r').to_string())
    }

    fn handle_line(&mut self, line: String, handler: &mut dyn CommandHandler) {
        match std::mem::replace(&mut self.auth, Auth::Open) {
            Auth::Open => {
                let Execution { reply, close } = execute_line(&line, handler);
                if let Some(reply) = reply {
                    self.reply(&reply);
                }
                if close {
                    self.closing = true;
                }
            }
            Auth::AwaitComponent { secret } => {
                let challenge = handshake::challenge();
                self.reply(&format!("{challenge}\n"));
                self.auth = Auth::AwaitResponse {
                    secret,
                    challenge,
                    component: line,
                };
            }
            Auth::AwaitResponse {
                secret,
                challenge,
                component,
            } => {
                if handshake::verify(&challenge, &secret, line.trim()) {
                    info!(
                        "control client {} authenticated as {component:?}",
                        self.peer
                    );
                    self.reply("authenticated\n");
                } else {
                    warn!(
                        "control client {} ({component:?}) failed to authenticate",
                        self.peer
                    );
                    self.reply("error: authentication failed\n");
                    self.closing = true;
                }
            }
        }
    }

    /// Write as much pending output as possible. Returns false on a
    /// hard error.
    fn flush_output(&mut self) -> bool {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => return false,
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => {
                    debug!("control connection {}: write error: {e}", self.peer);
                    return false;
                }
            }
        }
        true
    }

    /// Read, execute complete request lines, write replies. Never
    /// blocks.
    pub fn process(&mut self, handler: &mut dyn CommandHandler) -> ConnectionStatus {
        if !self.flush_output() {
            return ConnectionStatus::Closed;
        }
        if !self.closing && !self.eof && !self.is_backlogged() {
            if !self.fill_input() {
                return ConnectionStatus::Closed;
            }
        }
        while !self.closing && !self.is_backlogged() {
            match self.next_line() {
                Some(line) => self.handle_line(line, handler),
                None => break,
            }
        }
        if !self.closing && self.input.len() > MAX_LINE_LEN && !self.input.contains(&b'\n') {
            warn!("control connection {}: request line too long", self.peer);
            self.input.clear();
            self.reply("error: request line too long\n");
            self.closing = true;
        }
        if !self.flush_output() {
            return ConnectionStatus::Closed;
        }
        if (self.closing || self.eof) && self.output.is_empty() {
            ConnectionStatus::Closed
        } else {
            ConnectionStatus::Open
        }
    }
}
