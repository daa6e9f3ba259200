use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};

#[derive(thiserror::Error, Debug)]
pub enum SendSignalError {
    #[error("don't have permission to send signal to pid {pid}")]
    PermissionDenied { pid: Pid },
    #[error("sending signal to pid {pid}: {error}")]
    Errno { pid: Pid, error: Errno },
}

/// Send `signal` to `pid` (`None` only checks for existence). Returns
/// whether the process exists.
pub fn send_signal_to_pid(pid: Pid, signal: Option<Signal>) -> Result<bool, SendSignalError> {
    match kill(pid, signal) {
        Ok(()) => Ok(true),
        Err(e) => match e {
            // The process exists but belongs to someone else; that's
            // not "not running".
            Errno::EPERM => Err(SendSignalError::PermissionDenied { pid }),
            // Process does not exist
            Errno::ESRCH => Ok(false),
            error => Err(SendSignalError::Errno { pid, error }),
        },
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::getpid;

    use super::*;

    #[test]
    fn t_probe_self() {
        assert!(send_signal_to_pid(getpid(), None).unwrap());
    }
}
