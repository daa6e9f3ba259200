//! Put a service into the background: double fork (or re-exec if
//! threads are already running), new session, and a readiness pipe
//! so that the invoking process only exits once the service has
//! started up, with an exit code telling whether it did.

use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    process::exit,
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    libc,
    poll::{poll, PollFd, PollFlags},
    unistd::{chdir, getpid, pipe2, read, setsid, write, Pid},
};
use tracing::{error, info, warn};

use crate::{
    re_exec::spawn_self_in_new_session,
    unix::{
        check_single_threaded, easy_fork, redirect_to_dev_null, waitpid_until_gone, ForkError,
    },
};

/// Environment variable carrying the readiness pipe's fd number to a
/// re-executed daemon.
pub const READY_FD_ENV: &str = "SVCFRAME_READY_FD";

/// The byte written on successful startup.
const READY_BYTE: u8 = b'R';

/// How long the waiting parent sleeps in `poll` before checking
/// whether it should give up.
const WAIT_SLICE_MS: libc::c_int = 100;

#[derive(Debug, Clone, Default, clap::Args)]
pub struct DaemonizeOpts {
    /// Run in the background. The invoking process exits once the
    /// service has started up (0) or failed doing so (non-zero).
    #[clap(short = 'd', long)]
    pub daemonize: bool,

    /// When daemonizing, keep the current working directory (default:
    /// change to `/`).
    #[clap(long)]
    pub daemonize_nochdir: bool,

    /// When daemonizing, don't redirect stdin to /dev/null and
    /// stdout/stderr to the log file.
    #[clap(long)]
    pub daemonize_noclose: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum DaemonizeError {
    #[error("{context}: {error}")]
    ErrnoError {
        context: &'static str,
        error: nix::errno::Errno,
    },
    #[error("invalid SVCFRAME_READY_FD value {0:?}")]
    InvalidReadyFd(String),
    #[error("{0}")]
    Fork(#[from] ForkError),
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
}

/// Held by the daemon until it is done starting up. Dropping it
/// without calling `notify` makes the waiting parent report failure.
#[derive(Debug)]
pub struct Readiness {
    fd: Option<OwnedFd>,
    owner: Pid,
}

impl Readiness {
    /// For services running in the foreground.
    pub fn none() -> Self {
        Readiness {
            fd: None,
            owner: getpid(),
        }
    }

    /// Whether a parent is still waiting for us.
    pub fn is_pending(&self) -> bool {
        self.fd.is_some()
    }

    /// Tell the waiting parent that startup is complete, and let go
    /// of the pipe.
    pub fn notify(&mut self) -> Result<(), DaemonizeError> {
        if let Some(fd) = self.fd.take() {
            loop {
                match write(fd.as_raw_fd(), &[READY_BYTE]) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    // The parent may have given up already.
                    Err(Errno::EPIPE) => break,
                    Err(error) => {
                        return Err(DaemonizeError::ErrnoError {
                            context: "writing to the readiness pipe",
                            error,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// To be called in a freshly forked child: only the daemon
    /// process itself may report readiness.
    pub fn close_in_child(&mut self) {
        if getpid() != self.owner {
            self.fd = None;
        }
    }
}

/// Redirect stdin to /dev/null.
pub fn close_stdin() -> Result<(), DaemonizeError> {
    redirect_to_dev_null(0, OFlag::O_RDONLY).map_err(|error| DaemonizeError::ErrnoError {
        context: "redirecting stdin to /dev/null",
        error,
    })
}

/// Wait for the readiness byte on `fd` from `child` (or one of its
/// descendants). Returns the exit code the waiting process should
/// use.
fn wait_for_ready(fd: &OwnedFd, child: Pid, is_running: &dyn Fn() -> bool) -> i32 {
    let mut buf = [0u8; 1];
    loop {
        if !is_running() {
            warn!("terminated during daemonization");
            return 1;
        }
        let mut fds = [PollFd::new(fd.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, WAIT_SLICE_MS) {
            Ok(0) => continue,
            Ok(_) => (),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("waiting for the daemon to start: poll: {e}");
                return 1;
            }
        }
        match read(fd.as_raw_fd(), &mut buf) {
            Ok(1) if buf[0] == READY_BYTE => return 0,
            Ok(1) => continue,
            Ok(_) => {
                // EOF without the byte: the child ended or gave up.
                return match waitpid_until_gone(child) {
                    Ok(status) => match status.exit_code() {
                        0 => 1,
                        code => code,
                    },
                    // Not our child (the grandchild case).
                    Err(Errno::ECHILD) => 1,
                    Err(e) => {
                        error!("waiting for pid {child}: {e}");
                        1
                    }
                };
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("reading from the readiness pipe: {e}");
                return 1;
            }
        }
    }
}

fn make_pipe(context: &'static str) -> Result<(OwnedFd, OwnedFd), DaemonizeError> {
    let (r, w) =
        pipe2(OFlag::O_CLOEXEC).map_err(|error| DaemonizeError::ErrnoError { context, error })?;
    Ok(unsafe {
        // Safe: fresh descriptors owned by nobody else.
        (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w))
    })
}

/// Log and leave an intermediate process.
fn die(msg: std::fmt::Arguments) -> ! {
    error!("{msg}");
    unsafe { libc::_exit(1) }
}

fn change_to_root_dir(opts: &DaemonizeOpts) {
    if !opts.daemonize_nochdir {
        if let Err(e) = chdir("/") {
            warn!("cannot change working directory to /: {e}");
        }
    }
}

/// If we were re-executed by `daemonize`, take over the readiness fd.
fn inherited_readiness() -> Result<Option<Readiness>, DaemonizeError> {
    let Some(val) = std::env::var_os(READY_FD_ENV) else {
        return Ok(None);
    };
    std::env::remove_var(READY_FD_ENV);
    let s = val.to_string_lossy().into_owned();
    let fd: RawFd = s
        .parse()
        .ok()
        .filter(|fd| *fd > 2)
        .ok_or(DaemonizeError::InvalidReadyFd(s))?;
    // Don't pass it on to anything we exec.
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))
        .map_err(|error| DaemonizeError::ErrnoError {
            context: "marking the inherited readiness fd close-on-exec",
            error,
        })?;
    Ok(Some(Readiness {
        fd: Some(unsafe {
            // Safe: handed to us explicitly by our parent.
            OwnedFd::from_raw_fd(fd)
        }),
        owner: getpid(),
    }))
}

/// Move into the background. Only returns in the daemon process (and
/// with an error if it fails before forking); the invoking process
/// exits with 0 once the daemon calls `Readiness::notify`, or with
/// a non-zero code if it ends before that. `is_running` is polled by
/// the waiting processes, returning false makes them give up.
pub fn daemonize(
    opts: &DaemonizeOpts,
    is_running: &dyn Fn() -> bool,
) -> Result<Readiness, DaemonizeError> {
    if let Some(readiness) = inherited_readiness()? {
        change_to_root_dir(opts);
        return Ok(readiness);
    }

    if let Err(e) = check_single_threaded() {
        info!("{e}, daemonizing via re-exec");
        return daemonize_via_re_exec(is_running);
    }

    let (r1, w1) = make_pipe("pipe for the first readiness notifier")?;
    if let Some(child) = easy_fork()? {
        drop(w1);
        let code = wait_for_ready(&r1, child, is_running);
        if code == 0 {
            info!("service running in background");
        } else {
            error!("child process failed");
        }
        exit(code);
    }

    // First child.
    drop(r1);
    if let Err(e) = setsid() {
        die(format_args!("unable to become a session leader: {e}"));
    }
    let (r2, w2) = match make_pipe("pipe for the second readiness notifier") {
        Ok(p) => p,
        Err(e) => die(format_args!("{e}")),
    };
    match easy_fork() {
        Err(e) => die(format_args!("failed secondary fork: {e}")),
        Ok(Some(grandchild)) => {
            drop(w2);
            let code = wait_for_ready(&r2, grandchild, is_running);
            if code == 0 {
                let mut forward = Readiness {
                    fd: Some(w1),
                    owner: getpid(),
                };
                if let Err(e) = forward.notify() {
                    die(format_args!("{e}"));
                }
            }
            unsafe { libc::_exit(code) }
        }
        Ok(None) => {
            // The daemon.
            drop(r2);
            drop(w1);
            change_to_root_dir(opts);
            Ok(Readiness {
                fd: Some(w2),
                owner: getpid(),
            })
        }
    }
}

fn daemonize_via_re_exec(is_running: &dyn Fn() -> bool) -> Result<Readiness, DaemonizeError> {
    let (r, w) = make_pipe("pipe for the readiness notifier")?;
    let child =
        spawn_self_in_new_session(w.as_raw_fd(), &[(READY_FD_ENV, w.as_raw_fd().to_string())])?;
    drop(w);
    let code = wait_for_ready(&r, Pid::from_raw(child.id() as i32), is_running);
    if code == 0 {
        info!("service running in background");
    } else {
        error!("child process failed");
    }
    exit(code);
}
