//! Single instance guard: a file holding the pid of the running
//! service, `flock`ed by the process that wrote it for as long as it
//! lives.
//!
//! A pid file is considered stale (and may be replaced) if nobody
//! holds the lock on it, or if the pid written into it does not
//! exist anymore.

use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::Signal,
    unistd::{getpid, Pid},
};
use tracing::{debug, warn};

use crate::{
    file_lock::{lock_file, FileLock, FileLockError},
    file_util::{create_parent_dirs, file_identity, path_identity, PathIOError},
    signal::{send_signal_to_pid, SendSignalError},
    unix::LockMode,
};

/// How many times the create/inspect cycle is retried when racing
/// with other processes.
const MAX_ALLOCATE_ATTEMPTS: u32 = 16;

/// Poll interval for `ScopedPidFile::allocate_with_timeout`.
pub const ALLOCATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum PidFileError {
    #[error("another instance is running{}", pid_suffix(.pid))]
    AlreadyRunning { pid: Option<Pid> },
    #[error("{0}")]
    PathIO(#[from] PathIOError),
    #[error("could not lock {path:?}: {error}")]
    Lock { path: Arc<Path>, error: nix::errno::Errno },
    #[error("pid file {path:?} does not contain a valid pid: {contents:?}")]
    InvalidContents { path: Arc<Path>, contents: String },
    #[error("{0}")]
    Signal(#[from] SendSignalError),
    #[error("giving up on {path:?}, it keeps changing under us")]
    Contended { path: Arc<Path> },
}

fn pid_suffix(pid: &Option<Pid>) -> String {
    match pid {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

/// An allocated pid file. The lock is held until this value is
/// dropped (or forever, after `leak`). The file itself is left in
/// place, see `ScopedPidFile` for removal.
pub struct PidFile {
    path: Arc<Path>,
    owner: Pid,
    identity: (u64, u64),
    lock: FileLock,
}

impl std::fmt::Debug for PidFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidFile")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Result of `signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The holder exists and the signal was delivered.
    Signalled(Pid),
    /// There is no live holder.
    NotRunning,
    /// There is no pid file at all (only when asked to report it).
    Missing,
}

fn read_pid_from(file: &mut File, path: &Arc<Path>) -> Result<Option<Pid>, PathIOError> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|error| PathIOError::new("read pid file", path, error))?;
    Ok(parse_pid(&contents))
}

fn parse_pid(contents: &str) -> Option<Pid> {
    match contents.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Some(Pid::from_raw(pid)),
        _ => None,
    }
}

/// Remove the file at `path` if it's still the one we inspected.
fn remove_if_same(path: &Arc<Path>, identity: (u64, u64)) -> Result<(), PathIOError> {
    match path_identity(path) {
        Ok(Some(current)) if current == identity => match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(PathIOError::new("remove stale pid file", path, error)),
        },
        Ok(_) => Ok(()),
        Err(error) => Err(PathIOError::new("stat pid file", path, error)),
    }
}

enum Inspection {
    /// The file went away or was replaced, just retry.
    Vanished,
    /// Removed a stale file, retry.
    Removed,
    Running(Option<Pid>),
}

/// Look at an existing pid file and remove it if it is stale.
fn inspect_existing(path: &Arc<Path>) -> Result<Inspection, PidFileError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Inspection::Vanished),
        Err(error) => return Err(PathIOError::new("open existing pid file", path, error).into()),
    };
    let identity =
        file_identity(&file).map_err(|error| PathIOError::new("stat pid file", path, error))?;
    let recorded = read_pid_from(&mut file, path)?;
    match lock_file(file, LockMode::Exclusive, true) {
        Ok(lock) => {
            warn!(
                "removing stale pid file {path:?} (pid {recorded:?}, nobody holds its lock)"
            );
            remove_if_same(path, identity)?;
            drop(lock);
            Ok(Inspection::Removed)
        }
        Err(FileLockError::AlreadyLocked) => match recorded {
            Some(pid) => match send_signal_to_pid(pid, None) {
                // EPERM: alive, running as another user.
                Ok(true) | Err(SendSignalError::PermissionDenied { .. }) => {
                    Ok(Inspection::Running(Some(pid)))
                }
                Ok(false) => {
                    // Lock held by someone who inherited the
                    // descriptor, but the writer is gone.
                    warn!("removing stale pid file {path:?} (pid {pid} does not exist)");
                    remove_if_same(path, identity)?;
                    Ok(Inspection::Removed)
                }
                Err(e) => Err(e.into()),
            },
            // Locked but not yet written, the holder is in the
            // middle of allocating.
            None => Ok(Inspection::Running(None)),
        },
        Err(FileLockError::FlockError(error)) => Err(PidFileError::Lock {
            path: path.clone(),
            error,
        }),
        Err(FileLockError::OpenError(error)) => {
            Err(PathIOError::new("open existing pid file", path, error).into())
        }
    }
}

impl PidFile {
    /// Create `path` holding our pid, and lock it. Fails with
    /// `PidFileError::AlreadyRunning` if a live process holds it.
    /// Stale files are removed and replaced. Parent directories are
    /// created as needed.
    pub fn allocate<P: AsRef<Path>>(path: P) -> Result<PidFile, PidFileError> {
        let path: Arc<Path> = path.as_ref().into();
        create_parent_dirs(&path)?;
        let owner = getpid();

        for _ in 0..MAX_ALLOCATE_ATTEMPTS {
            let created = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&path);
            match created {
                Ok(file) => {
                    let identity = file_identity(&file)
                        .map_err(|error| PathIOError::new("stat pid file", &path, error))?;
                    // Others only hold locks on it briefly (probing),
                    // thus block.
                    let mut lock = match lock_file(file, LockMode::Exclusive, false) {
                        Ok(lock) => lock,
                        Err(FileLockError::FlockError(error)) => {
                            return Err(PidFileError::Lock {
                                path: path.clone(),
                                error,
                            })
                        }
                        Err(e) => {
                            debug!("pid file {path:?}: {e}, retrying");
                            continue;
                        }
                    };
                    // Somebody may have taken our unlocked file for
                    // stale and removed it in the mean time.
                    match path_identity(&path) {
                        Ok(Some(current)) if current == identity => (),
                        Ok(_) => {
                            debug!("pid file {path:?} was replaced while locking, retrying");
                            continue;
                        }
                        Err(error) => {
                            return Err(PathIOError::new("stat pid file", &path, error).into())
                        }
                    }
                    lock.with_file(|file| {
                        file.write_all(format!("{owner}\n").as_bytes())
                            .and_then(|()| file.flush())
                    })
                    .map_err(|error| PathIOError::new("write pid file", &path, error))?;
                    return Ok(PidFile {
                        path,
                        owner,
                        identity,
                        lock,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match inspect_existing(&path)? {
                    Inspection::Vanished | Inspection::Removed => continue,
                    Inspection::Running(pid) => return Err(PidFileError::AlreadyRunning { pid }),
                },
                Err(error) => {
                    return Err(PathIOError::new("create pid file", &path, error).into());
                }
            }
        }
        Err(PidFileError::Contended { path })
    }

    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    /// The pid written into the file.
    pub fn pid(&self) -> Pid {
        self.owner
    }

    /// Keep the descriptor (and thus the lock) open until the process
    /// exits.
    pub fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if getpid() != self.owner {
            // A forked copy; unlocking would release the owner's lock.
            self.lock.leak();
        }
    }
}

/// A `PidFile` that is removed from the file system when dropped in
/// the process that allocated it.
#[derive(Debug)]
pub struct ScopedPidFile {
    pid_file: PidFile,
}

impl ScopedPidFile {
    pub fn allocate<P: AsRef<Path>>(path: P) -> Result<Self, PidFileError> {
        Ok(ScopedPidFile {
            pid_file: PidFile::allocate(path)?,
        })
    }

    /// Like `allocate`, but while another instance is running, retry
    /// every `ALLOCATE_POLL_INTERVAL` until `timeout` has passed.
    pub fn allocate_with_timeout<P: AsRef<Path>>(
        path: P,
        timeout: Duration,
    ) -> Result<Self, PidFileError> {
        let deadline = Instant::now() + timeout;
        loop {
            match PidFile::allocate(path.as_ref()) {
                Ok(pid_file) => return Ok(ScopedPidFile { pid_file }),
                Err(e @ PidFileError::AlreadyRunning { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    sleep(ALLOCATE_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }
}

impl Drop for ScopedPidFile {
    fn drop(&mut self) {
        let PidFile {
            path,
            owner,
            identity,
            ..
        } = &self.pid_file;
        if getpid() == *owner {
            _ = remove_if_same(path, *identity);
        }
    }
}

/// Send `signal` to the process holding the pid file at `path`;
/// `None` just checks whether it is running. A missing file gives
/// `SignalOutcome::NotRunning`, or `SignalOutcome::Missing` if
/// `report_missing` is true.
pub fn signal<P: AsRef<Path>>(
    path: P,
    signal: Option<Signal>,
    report_missing: bool,
) -> Result<SignalOutcome, PidFileError> {
    let path: Arc<Path> = path.as_ref().into();
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(if report_missing {
                SignalOutcome::Missing
            } else {
                SignalOutcome::NotRunning
            })
        }
        Err(error) => return Err(PathIOError::new("open pid file", &path, error).into()),
    };
    let recorded = read_pid_from(&mut file, &path)?;
    // A shared lock suffices to find out whether the holder's
    // exclusive one is in place, and doesn't conflict with other
    // probes.
    match lock_file(file, LockMode::Shared, true) {
        Ok(_lock) => Ok(SignalOutcome::NotRunning),
        Err(FileLockError::AlreadyLocked) => {
            let pid = recorded.ok_or_else(|| PidFileError::InvalidContents {
                path: path.clone(),
                contents: std::fs::read_to_string(&path).unwrap_or_default(),
            })?;
            match send_signal_to_pid(pid, signal) {
                Ok(true) => Ok(SignalOutcome::Signalled(pid)),
                Ok(false) => Ok(SignalOutcome::NotRunning),
                // A probe only asks whether it's alive, and it is.
                Err(SendSignalError::PermissionDenied { .. }) if signal.is_none() => {
                    Ok(SignalOutcome::Signalled(pid))
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(FileLockError::FlockError(error)) => Err(PidFileError::Lock { path, error }),
        Err(FileLockError::OpenError(error)) => {
            Err(PathIOError::new("open pid file", &path, error).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::{
        libc,
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, geteuid, setuid, ForkResult, Uid},
    };

    use super::*;

    /// Run `f` in a forked child (plain fork, the test harness is
    /// threaded) and return its exit code.
    fn in_child(f: impl FnOnce() -> i32) -> i32 {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = f();
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, code) => code,
                st => panic!("child ended with {st:?}"),
            },
        }
    }

    fn allocate_result_code(path: &Path, holder: Pid) -> i32 {
        match PidFile::allocate(path) {
            Err(PidFileError::AlreadyRunning { pid }) if pid == Some(holder) => 0,
            Err(PidFileError::AlreadyRunning { .. }) => 1,
            Err(_) => 2,
            Ok(_) => 3,
        }
    }

    #[test]
    fn t_parse_pid() {
        assert_eq!(parse_pid("123\n"), Some(Pid::from_raw(123)));
        assert_eq!(parse_pid(" 7 "), Some(Pid::from_raw(7)));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("0\n"), None);
        assert_eq!(parse_pid("-3\n"), None);
        assert_eq!(parse_pid("abc"), None);
    }

    #[test]
    fn t_allocate_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/dir/service.pid");
        let pid_file = PidFile::allocate(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\n", getpid())
        );
        assert_eq!(pid_file.pid(), getpid());
    }

    #[test]
    fn t_second_allocate_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.pid");
        let _first = PidFile::allocate(&path).unwrap();
        match PidFile::allocate(&path) {
            Err(PidFileError::AlreadyRunning { pid }) => assert_eq!(pid, Some(getpid())),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn t_stale_unlocked_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.pid");
        std::fs::write(&path, "999999\n").unwrap();
        let _pid_file = PidFile::allocate(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\n", getpid())
        );
    }

    #[test]
    fn t_signal_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.pid");
        assert_eq!(signal(&path, None, false).unwrap(), SignalOutcome::NotRunning);
        assert_eq!(signal(&path, None, true).unwrap(), SignalOutcome::Missing);
        {
            let _pid_file = ScopedPidFile::allocate(&path).unwrap();
            assert_eq!(
                signal(&path, None, true).unwrap(),
                SignalOutcome::Signalled(getpid())
            );
        }
        // Removed on drop.
        assert!(!path.exists());
        assert_eq!(signal(&path, None, true).unwrap(), SignalOutcome::Missing);
    }

    #[test]
    fn t_unlocked_file_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.pid");
        std::fs::write(&path, format!("{}\n", getpid())).unwrap();
        assert_eq!(signal(&path, None, true).unwrap(), SignalOutcome::NotRunning);
    }

    #[test]
    fn t_allocate_with_timeout_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.pid");
        let _first = PidFile::allocate(&path).unwrap();
        let t0 = Instant::now();
        let res = ScopedPidFile::allocate_with_timeout(&path, Duration::from_millis(250));
        assert!(matches!(res, Err(PidFileError::AlreadyRunning { .. })));
        assert!(t0.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn t_held_by_other_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.pid");
        let _first = PidFile::allocate(&path).unwrap();
        let holder = getpid();
        assert_eq!(in_child(|| allocate_result_code(&path, holder)), 0);
        // The probe left the file alone.
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{holder}\n")
        );
    }

    #[test]
    fn t_held_by_other_user() {
        if !geteuid().is_root() {
            return;
        }
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = dir.path().join("service.pid");
        let _first = PidFile::allocate(&path).unwrap();
        let holder = getpid();
        let code = in_child(|| {
            if setuid(Uid::from_raw(65534)).is_err() {
                return 4;
            }
            match signal(&path, None, false) {
                Ok(SignalOutcome::Signalled(pid)) if pid == holder => (),
                _ => return 5,
            }
            allocate_result_code(&path, holder)
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn t_allocate_with_timeout_waits_for_other_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.pid");
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match PidFile::allocate(&path) {
                    Ok(pid_file) => {
                        sleep(Duration::from_millis(300));
                        drop(pid_file);
                        0
                    }
                    Err(_) => 1,
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => child,
        };
        let t0 = Instant::now();
        while std::fs::read_to_string(&path).ok() != Some(format!("{child}\n")) {
            assert!(t0.elapsed() < Duration::from_secs(5));
            sleep(Duration::from_millis(5));
        }
        let pid_file = ScopedPidFile::allocate_with_timeout(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(pid_file.pid_file().pid(), getpid());
        assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
    }
}
