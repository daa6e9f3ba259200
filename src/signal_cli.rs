//! `--signal`: talking to a running instance via its pid file.
//!
//! Exit codes: 0 success (or running, for `status`), 1 not running,
//! 2 `stop/N` timed out, 3 error sending the signal (for `status`: no
//! pid file), 4 status could not be determined.

use std::{
    path::Path,
    str::FromStr,
    thread::sleep,
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;
use svcframe_unix::pid_file::{self, SignalOutcome, ALLOCATE_POLL_INTERVAL};
use tracing::{error, info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_NOT_RUNNING: i32 = 1;
pub const EXIT_STOP_TIMEOUT: i32 = 2;
pub const EXIT_SIGNAL_ERROR: i32 = 3;
pub const EXIT_STATUS_UNKNOWN: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Stop,
    LogRotate,
    Status,
    Stat,
}

impl SignalKind {
    /// `None` for the existence probe.
    pub fn signal(self) -> Option<Signal> {
        match self {
            SignalKind::Stop => Some(Signal::SIGTERM),
            SignalKind::LogRotate => Some(Signal::SIGHUP),
            SignalKind::Status => None,
            SignalKind::Stat => Some(Signal::SIGUSR1),
        }
    }
}

/// `stop[/seconds]`, `logrotate`, `status` or `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSpec {
    pub name: String,
    pub kind: SignalKind,
    /// Only for `stop`.
    pub timeout: Option<Duration>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SignalSpecError {
    #[error("unrecognized signal: {0:?}")]
    Unknown(String),
    #[error("invalid timeout specification {0:?}")]
    InvalidTimeout(String),
}

impl FromStr for SignalSpec {
    type Err = SignalSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, timeout) = match s.split_once('/') {
            Some((name, timeout)) => (name, Some(timeout)),
            None => (s, None),
        };
        let kind = match name {
            "stop" => SignalKind::Stop,
            "logrotate" => SignalKind::LogRotate,
            "status" => SignalKind::Status,
            "stat" => SignalKind::Stat,
            _ => return Err(SignalSpecError::Unknown(name.into())),
        };
        let timeout = match timeout {
            None => None,
            Some(t) if kind == SignalKind::Stop => Some(Duration::from_secs(
                t.parse()
                    .map_err(|_| SignalSpecError::InvalidTimeout(t.into()))?,
            )),
            Some(_) => {
                warn!("ignoring timeout specification for signal {name:?}");
                None
            }
        };
        Ok(SignalSpec {
            name: name.into(),
            kind,
            timeout,
        })
    }
}

fn wait_for_stop(pidfile: &Path, timeout: Duration) -> i32 {
    let deadline = Instant::now() + timeout;
    let mut first = true;
    loop {
        match pid_file::signal(pidfile, Some(Signal::SIGTERM), false) {
            Ok(SignalOutcome::Signalled(_)) => (),
            Ok(SignalOutcome::NotRunning | SignalOutcome::Missing) => {
                return if first { EXIT_NOT_RUNNING } else { EXIT_OK };
            }
            Err(e) => {
                error!("cannot signal running instance: {e}");
                return EXIT_SIGNAL_ERROR;
            }
        }
        if Instant::now() >= deadline {
            return EXIT_STOP_TIMEOUT;
        }
        first = false;
        sleep(ALLOCATE_POLL_INTERVAL);
    }
}

fn process_status(pidfile: &Path) -> i32 {
    match pid_file::signal(pidfile, None, true) {
        Ok(SignalOutcome::Signalled(_)) => EXIT_OK,
        Ok(SignalOutcome::NotRunning) => EXIT_NOT_RUNNING,
        Ok(SignalOutcome::Missing) => EXIT_SIGNAL_ERROR,
        Err(e) => {
            error!("cannot signal running instance: {e}");
            EXIT_STATUS_UNKNOWN
        }
    }
}

/// Carry out `--signal spec` against the instance owning `pidfile`,
/// returning the exit code for the process.
pub fn send_signal(pidfile: &Path, spec: &str) -> i32 {
    let spec: SignalSpec = match spec.parse() {
        Ok(spec) => spec,
        Err(e) => {
            error!("{e}");
            return EXIT_SIGNAL_ERROR;
        }
    };
    info!("about to send signal {:?} to running process", spec.name);
    match (spec.kind, spec.timeout) {
        (SignalKind::Stop, Some(timeout)) => return wait_for_stop(pidfile, timeout),
        (SignalKind::Status, _) => return process_status(pidfile),
        _ => (),
    }
    match pid_file::signal(pidfile, spec.kind.signal(), false) {
        Ok(SignalOutcome::Signalled(_)) => EXIT_OK,
        Ok(SignalOutcome::NotRunning | SignalOutcome::Missing) => EXIT_NOT_RUNNING,
        Err(e) => {
            error!("cannot signal running instance: {e}");
            EXIT_SIGNAL_ERROR
        }
    }
}
