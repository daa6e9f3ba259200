//! Where log output goes: stderr while in the foreground, a log file
//! (reopened on log rotation) once running as a daemon.

use std::{
    fs::{File, OpenOptions},
    io::{stderr, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use nix::unistd::{chown, dup2};
use svcframe_unix::{
    file_util::open_append, persona::Identity, timestamp_formatter::TimestampFormatter,
    unix::redirect_to_dev_null,
};
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Debug, Clone, Default, clap::Args)]
pub struct LoggingOpts {
    /// Append log messages to this file instead of writing them to
    /// stderr.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// With `--log-file`, also echo log messages to stderr, until
    /// the service has daemonized.
    #[clap(long)]
    pub log_console: bool,

    /// Truncate the log file on startup.
    #[clap(long)]
    pub log_truncate: bool,

    /// On startup, rename an existing log file by appending its
    /// modification time (takes precedence over `--log-truncate`).
    #[clap(long)]
    pub log_archive: bool,

    #[clap(flatten)]
    pub timestamp: TimestampFormatter,
}

#[derive(Debug)]
struct SinkState {
    file: Option<File>,
    console: bool,
    stdio_tied: bool,
}

/// Shared handle to the log destination. Cloning gives another handle
/// to the same sink.
#[derive(Debug, Clone)]
pub struct LogSink {
    path: Option<Arc<Path>>,
    state: Arc<Mutex<SinkState>>,
}

/// Name for an archived copy of the log file at `path`, last modified
/// at `mtime`.
fn archive_path(path: &Path, mtime: DateTime<Local>) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(mtime.format(".%Y%m%d-%H%M%S").to_string());
    s.into()
}

fn archive(path: &Path) -> Result<()> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| anyhow!("checking log file {path:?}")),
    };
    let mtime: DateTime<Local> = meta
        .modified()
        .with_context(|| anyhow!("getting mtime of {path:?}"))?
        .into();
    let to = archive_path(path, mtime);
    std::fs::rename(path, &to).with_context(|| anyhow!("renaming {path:?} to {to:?}"))
}

impl LogSink {
    /// Log to stderr only.
    pub fn console() -> Self {
        LogSink {
            path: None,
            state: Arc::new(Mutex::new(SinkState {
                file: None,
                console: true,
                stdio_tied: false,
            })),
        }
    }

    pub fn open(opts: &LoggingOpts) -> Result<Self> {
        let Some(path) = &opts.log_file else {
            return Ok(Self::console());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| anyhow!("creating log directory {parent:?}"))?;
            }
        }
        if opts.log_archive {
            archive(path)?;
        }
        let file = if opts.log_truncate && !opts.log_archive {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .with_context(|| anyhow!("opening log file {path:?}"))?
        } else {
            open_append(path)?
        };
        Ok(LogSink {
            path: Some(Arc::from(path.as_path())),
            state: Arc::new(Mutex::new(SinkState {
                file: Some(file),
                console: opts.log_console,
                stdio_tied: false,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> Option<&Arc<Path>> {
        self.path.as_ref()
    }

    /// Stop echoing to stderr (which is about to go away).
    pub fn disable_console(&self) {
        self.lock().console = false;
    }

    fn tie_locked(state: &SinkState) -> Result<()> {
        if let Some(file) = &state.file {
            for fd in [1, 2] {
                dup2(file.as_raw_fd(), fd)
                    .with_context(|| anyhow!("redirecting fd {fd} to the log file"))?;
            }
        }
        Ok(())
    }

    /// Point stdout and stderr at the log file, so that output not
    /// going through `tracing` ends up there, too. Without a log file
    /// they are sent to /dev/null.
    pub fn tie_stdio(&self) -> Result<()> {
        let mut state = self.lock();
        if state.file.is_some() {
            Self::tie_locked(&state)?;
            state.stdio_tied = true;
        } else {
            for fd in [1, 2] {
                redirect_to_dev_null(fd, nix::fcntl::OFlag::O_WRONLY)
                    .with_context(|| anyhow!("redirecting fd {fd} to /dev/null"))?;
            }
        }
        state.console = false;
        Ok(())
    }

    /// Open the log file anew (after it was moved away by log
    /// rotation).
    pub fn reopen(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = open_append(path)?;
        let mut state = self.lock();
        state.file = Some(file);
        if state.stdio_tied {
            Self::tie_locked(&state)?;
        }
        Ok(())
    }

    /// Hand the log file over to the persona the service is going to
    /// run as.
    pub fn chown(&self, to: &Identity) -> Result<()> {
        if let Some(path) = &self.path {
            chown(&**path, Some(to.uid), Some(to.gid))
                .with_context(|| anyhow!("changing owner of log file {path:?} to {to}"))?;
        }
        Ok(())
    }
}

pub struct LogWriter {
    sink: LogSink,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.sink.lock();
        let console = state.console;
        match &mut state.file {
            Some(file) => {
                file.write_all(buf)?;
                if console {
                    _ = stderr().write_all(buf);
                }
            }
            None => stderr().write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut state = self.sink.lock();
        match &mut state.file {
            Some(file) => file.flush(),
            None => stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter { sink: self.clone() }
    }
}

/// Install the global `tracing` subscriber writing to `sink`. The
/// filter is taken from `RUST_LOG`, defaulting to `info`.
pub fn init_logging(opts: &LoggingOpts, sink: &LogSink) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_timer(opts.timestamp.clone())
                .with_ansi(opts.log_file.is_none())
                .with_writer(sink.clone()),
        )
        .try_init()
        .map_err(|e| anyhow!("installing the log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn t_archive_path() {
        let t = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            archive_path(Path::new("/var/log/svc.log"), t),
            PathBuf::from("/var/log/svc.log.20240309-070501")
        );
    }

    #[test]
    fn t_write_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/svc.log");
        let opts = LoggingOpts {
            log_file: Some(path.clone()),
            ..Default::default()
        };
        let sink = LogSink::open(&opts).unwrap();
        sink.make_writer().write_all(b"one\n").unwrap();
        let moved = dir.path().join("svc.log.1");
        std::fs::rename(&path, &moved).unwrap();
        sink.make_writer().write_all(b"two\n").unwrap();
        sink.reopen().unwrap();
        sink.make_writer().write_all(b"three\n").unwrap();
        assert_eq!(std::fs::read_to_string(&moved).unwrap(), "one\ntwo\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "three\n");
    }

    #[test]
    fn t_truncate_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        std::fs::write(&path, "old\n").unwrap();
        let mut opts = LoggingOpts {
            log_file: Some(path.clone()),
            log_truncate: true,
            ..Default::default()
        };
        drop(LogSink::open(&opts).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        std::fs::write(&path, "older\n").unwrap();
        opts.log_archive = true;
        drop(LogSink::open(&opts).unwrap());
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");
        assert!(names.iter().any(|n| n.starts_with("svc.log.")));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
