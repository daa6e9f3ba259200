use std::io::stderr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::{ffi::OsString, os::unix::process::CommandExt};

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::setsid;

pub fn current_exe() -> Result<PathBuf> {
    let path = std::env::current_exe().context("getting the path to the current executable")?;
    // On Linux, this gets " (deleted)" appended when the binary was
    // replaced. Undo that, sigh.
    let deleted_str = " (deleted)";
    let s = path.to_string_lossy();
    if s.ends_with(deleted_str) {
        let os = path.as_os_str().to_owned();
        let mut bs = os.into_encoded_bytes();
        if bs.ends_with(deleted_str.as_bytes()) {
            bs.truncate(bs.len() - deleted_str.as_bytes().len());
        } else {
            use std::io::Write;
            _ = writeln!(
                &mut stderr(),
                "can't find the bytes after a first match, in {path:?}"
            );
            return Ok(path);
        }
        let os = unsafe { OsString::from_encoded_bytes_unchecked(bs) };
        Ok(os.into())
    } else {
        Ok(path)
    }
}

/// Start the current executable again, with the same arguments, as
/// the leader of a new session. `inherit_fd` is made to survive the
/// exec (it is expected to carry `FD_CLOEXEC` in this process), and
/// `env` is added to the child's environment.
pub fn spawn_self_in_new_session(inherit_fd: RawFd, env: &[(&str, String)]) -> Result<Child> {
    let path = current_exe()?;
    let mut args = std::env::args_os();
    let arg0 = args.next();
    let mut cmd = Command::new(&path);
    cmd.args(args);
    if let Some(a0) = arg0 {
        cmd.arg0(a0);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    unsafe {
        // Safe: only async-signal-safe syscalls between fork and exec.
        cmd.pre_exec(move || {
            fcntl(inherit_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
            setsid()?;
            Ok(())
        });
    }
    cmd.spawn()
        .with_context(|| anyhow!("executing the binary {path:?}"))
}
