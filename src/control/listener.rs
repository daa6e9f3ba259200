//! Listening sockets of the control channel and the connections
//! accepted from them.

use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpListener},
    os::unix::{
        fs::{FileTypeExt, PermissionsExt},
        net::UnixListener,
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use nix::unistd::{chown, getpid, Gid, Group, Pid, Uid, User};
use tracing::{debug, info, warn};

use crate::control::connection::{
    CommandHandler, ConnectionStatus, ControlConnection, CtrlStream,
};

/// Ownership and permissions of the Unix control socket.
#[derive(Debug, Clone, Default)]
pub struct SocketAccess {
    pub user: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

enum Listener {
    Unix(UnixListener),
    Tcp {
        listener: TcpListener,
        secret: Arc<str>,
    },
}

/// All control listeners and connections of a process. Polled from
/// `SignalMultiplexer::process`.
pub struct ControlServer {
    listeners: Vec<Listener>,
    connections: Vec<ControlConnection>,
    socket_paths: Vec<PathBuf>,
    owner: Pid,
}

impl Default for ControlServer {
    fn default() -> Self {
        ControlServer {
            listeners: Vec::new(),
            connections: Vec::new(),
            socket_paths: Vec::new(),
            owner: getpid(),
        }
    }
}

fn lookup_uid(name: &str) -> Result<Uid> {
    Ok(User::from_name(name)
        .with_context(|| anyhow!("looking up user {name:?}"))?
        .ok_or_else(|| anyhow!("there is no user {name:?} present on the system"))?
        .uid)
}

fn lookup_gid(name: &str) -> Result<Gid> {
    Ok(Group::from_name(name)
        .with_context(|| anyhow!("looking up group {name:?}"))?
        .ok_or_else(|| anyhow!("there is no group {name:?} present on the system"))?
        .gid)
}

/// Parse an octal permission string like `0660`.
pub fn parse_mode(s: &str) -> Result<u32> {
    let mode = u32::from_str_radix(s.trim_start_matches("0o"), 8)
        .with_context(|| anyhow!("invalid octal file mode {s:?}"))?;
    if mode > 0o7777 {
        bail!("file mode {s:?} out of range");
    }
    Ok(mode)
}

impl ControlServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Listen on a Unix-domain socket at `path`. A socket already at
    /// `path` is replaced (callers hold the pid file, so it's a
    /// leftover).
    pub fn bind_unix(&mut self, path: &Path, access: &SocketAccess) -> Result<()> {
        match std::fs::symlink_metadata(path) {
            Ok(m) if m.file_type().is_socket() => std::fs::remove_file(path)
                .with_context(|| anyhow!("removing old control socket {path:?}"))?,
            Ok(_) => bail!("{path:?} exists and is not a socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => return Err(e).with_context(|| anyhow!("checking {path:?}")),
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| anyhow!("creating directory {parent:?}"))?;
            }
        }
        let listener =
            UnixListener::bind(path).with_context(|| anyhow!("binding control socket {path:?}"))?;
        listener.set_nonblocking(true)?;
        self.socket_paths.push(path.to_owned());

        let uid = access.user.as_deref().map(lookup_uid).transpose()?;
        let gid = access.group.as_deref().map(lookup_gid).transpose()?;
        if uid.is_some() || gid.is_some() {
            chown(path, uid, gid)
                .with_context(|| anyhow!("changing owner of control socket {path:?}"))?;
        }
        if let Some(mode) = access.mode {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .with_context(|| anyhow!("changing mode of control socket {path:?}"))?;
        }
        info!("listening for control connections on {path:?}");
        self.listeners.push(Listener::Unix(listener));
        Ok(())
    }

    /// Listen on TCP; clients have to authenticate with `secret`.
    /// Returns the bound address (useful with port 0).
    pub fn bind_tcp(&mut self, addr: &str, secret: &str) -> Result<SocketAddr> {
        if secret.is_empty() {
            bail!("refusing to listen for network control connections without a secret");
        }
        let listener = TcpListener::bind(addr)
            .with_context(|| anyhow!("binding control listener to {addr:?}"))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        info!("listening for network control connections on {local}");
        self.listeners.push(Listener::Tcp {
            listener,
            secret: Arc::from(secret),
        });
        Ok(local)
    }

    fn accept_pending(&mut self) {
        for listener in &self.listeners {
            loop {
                let accepted = match listener {
                    Listener::Unix(l) => l
                        .accept()
                        .map(|(s, _)| (CtrlStream::Unix(s), "unix".to_string(), None)),
                    Listener::Tcp { listener, secret } => listener
                        .accept()
                        .map(|(s, addr)| (CtrlStream::Tcp(s), addr.to_string(), Some(secret.clone()))),
                };
                match accepted {
                    Ok((stream, peer, secret)) => {
                        match ControlConnection::new(stream, peer, secret) {
                            Ok(conn) => {
                                debug!("control connection from {}", conn.peer());
                                self.connections.push(conn);
                            }
                            Err(e) => warn!("setting up control connection: {e}"),
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => (),
                    Err(e) => {
                        warn!("accepting control connection: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Accept new clients and serve all connections once.
    pub fn process(&mut self, handler: &mut dyn CommandHandler) {
        self.accept_pending();
        self.connections.retain_mut(|conn| match conn.process(handler) {
            ConnectionStatus::Open => true,
            ConnectionStatus::Closed => {
                debug!("control connection from {} closed", conn.peer());
                false
            }
        });
    }

    /// For a forked child: stop serving, without removing the socket
    /// which still belongs to the parent.
    pub fn stop_accepting(&mut self) {
        self.listeners.clear();
        self.connections.clear();
        self.socket_paths.clear();
    }

    /// Stop serving and remove our sockets.
    pub fn close(&mut self) {
        self.listeners.clear();
        self.connections.clear();
        if getpid() == self.owner {
            for path in &self.socket_paths {
                _ = std::fs::remove_file(path);
            }
        }
        self.socket_paths.clear();
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if getpid() == self.owner {
            for path in &self.socket_paths {
                _ = std::fs::remove_file(path);
            }
        }
    }
}

#[test]
fn t_parse_mode() {
    assert_eq!(parse_mode("0660").unwrap(), 0o660);
    assert_eq!(parse_mode("755").unwrap(), 0o755);
    assert!(parse_mode("0999").is_err());
    assert!(parse_mode("77777").is_err());
}
