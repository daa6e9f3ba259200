use std::fs::File;

use nix::errno::Errno;
use ouroboros::self_referencing;

use crate::unix::{easy_flock, FlockGuard, LockMode};

/// An open file together with the `flock` held on it.
#[self_referencing]
pub struct FileLock {
    file: File,

    #[borrows(mut file)]
    #[covariant]
    flock_guard: FlockGuard<'this>,
}

#[derive(thiserror::Error, Debug)]
pub enum FileLockError {
    #[error("opening file path")]
    OpenError(#[from] std::io::Error),
    #[error("calling flock")]
    FlockError(#[from] Errno),
    #[error("lock already taken")]
    AlreadyLocked,
}

impl FileLock {
    /// Keep the lock in place when this value is dropped (see
    /// `FlockGuard::leak`). The file descriptor is still closed.
    pub fn leak(&mut self) {
        self.with_flock_guard_mut(|g| {
            g.leak();
        });
    }

    /// Run `f` with the locked file. Panics if called after `leak`.
    pub fn with_file<R>(&mut self, f: impl FnOnce(&mut File) -> R) -> R {
        self.with_flock_guard_mut(|g| f(g))
    }
}

/// Take an flock based lock on an already opened file. Gives
/// `FileLockError::AlreadyLocked` if `nonblock` and somebody else
/// holds a conflicting lock.
pub fn lock_file(file: File, mode: LockMode, nonblock: bool) -> Result<FileLock, FileLockError> {
    FileLock::try_new(file, |file| {
        if let Some(flock_guard) = easy_flock(file, mode, nonblock)? {
            Ok(flock_guard)
        } else {
            Err(FileLockError::AlreadyLocked)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let _first = lock_file(File::create(&path).unwrap(), LockMode::Exclusive, true).unwrap();
        match lock_file(File::open(&path).unwrap(), LockMode::Shared, true) {
            Err(FileLockError::AlreadyLocked) => (),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("got a second lock"),
        }
    }
}
