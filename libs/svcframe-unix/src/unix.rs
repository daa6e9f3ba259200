//! Some utilities for unix specific functionality

use std::fs::File;
use std::ops::Deref;
use std::ops::DerefMut;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use nix::fcntl::{flock, FlockArg, OFlag};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::{
    errno::Errno,
    sys::signal::Signal,
    unistd::{close, dup2, fork, ForkResult, Pid},
};
use num_threads::is_single_threaded;

#[derive(thiserror::Error, Debug)]
pub enum ForkError {
    #[error("other threads are running, refusing to fork")]
    OtherThreadsRunning,
    #[error("can't determine if other threads are running, refusing to fork")]
    UnknownThreadCount,
    #[error("fork: {0}")]
    Errno(#[from] Errno),
}

/// Whether `fork` can be used safely (no other threads are alive).
pub fn check_single_threaded() -> Result<(), ForkError> {
    match is_single_threaded() {
        Some(true) => Ok(()),
        Some(false) => Err(ForkError::OtherThreadsRunning),
        None => Err(ForkError::UnknownThreadCount),
    }
}

// Don't make it overly complicated, please. The original API is
// simple enough. If a Pid is given, it's the parent.
//
/// This function can only be run if there are no other threads
/// running; it checks and returns an error if there are.
pub fn easy_fork() -> Result<Option<Pid>, ForkError> {
    check_single_threaded()?;
    match unsafe {
        // Safe because there are no other threads (we checked above).
        fork()
    }? {
        ForkResult::Parent { child, .. } => Ok(Some(child)),
        ForkResult::Child => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normalexit(i32),
    Signalexit(Signal),
}

impl Status {
    /// Exit code as a shell would report it.
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Normalexit(code) => code,
            Status::Signalexit(signal) => 128 + signal as i32,
        }
    }
}

// Really wait until the given process has ended,
// and return a simpler enum.
pub fn waitpid_until_gone(pid: Pid) -> Result<Status, Errno> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_pid, exitcode)) => return Ok(Status::Normalexit(exitcode)),
            Ok(WaitStatus::Signaled(_pid, signal, _bool)) => {
                return Ok(Status::Signalexit(signal))
            }
            Ok(_) => {}              // stopped/continued, retry
            Err(Errno::EINTR) => {} // retry
            Err(e) => return Err(e),
        }
    }
}

/// Point `fd` at `/dev/null`, opened with `flags` (e.g. `O_RDONLY`
/// for stdin).
pub fn redirect_to_dev_null(fd: RawFd, flags: OFlag) -> Result<(), Errno> {
    let null = nix::fcntl::open("/dev/null", flags, Mode::empty())?;
    if null != fd {
        let res = dup2(null, fd);
        _ = close(null);
        res?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Represents an active lock via `flock`. Dropping it releases the
/// lock.
pub struct FlockGuard<'t> {
    file: Option<&'t mut File>,
}

impl<'t> FlockGuard<'t> {
    /// This "leaks" the lock, i.e. there will be no unlocking done on
    /// Drop. This is necessary in a forked child that drops its
    /// copy: `flock` locks belong to the open file description, which
    /// parent and child share, and an explicit unlock from the child
    /// would release the parent's lock, too. No leaking of memory is
    /// happening.
    pub fn leak(&mut self) -> Option<&'t mut File> {
        self.file.take()
    }
}

impl<'t> Deref for FlockGuard<'t> {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        self.file
            .as_ref()
            .expect("do not dereference the FlockGuard after calling leak() on it")
    }
}

impl<'t> DerefMut for FlockGuard<'t> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.file
            .as_mut()
            .expect("do not dereference the FlockGuard after calling leak() on it")
    }
}

impl<'t> Drop for FlockGuard<'t> {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let bfd: BorrowedFd = file.as_fd();
            // Errors are ignored: closing the file releases the lock
            // anyway, and there's nobody to report to from here.
            _ = flock(bfd.as_raw_fd(), FlockArg::Unlock);
        }
    }
}

pub fn easy_flock(
    file: &mut File,
    mode: LockMode,
    nonblock: bool,
) -> Result<Option<FlockGuard<'_>>, Errno> {
    let bfd: BorrowedFd = file.as_fd();
    let fd: i32 = bfd.as_raw_fd();
    let arg = match (mode, nonblock) {
        (LockMode::Exclusive, true) => FlockArg::LockExclusiveNonblock,
        (LockMode::Exclusive, false) => FlockArg::LockExclusive,
        (LockMode::Shared, true) => FlockArg::LockSharedNonblock,
        (LockMode::Shared, false) => FlockArg::LockShared,
    };
    loop {
        match flock(fd, arg) {
            Ok(()) => return Ok(Some(FlockGuard { file: Some(file) })),
            // Same as Errno::EAGAIN
            Err(Errno::EWOULDBLOCK) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}
