use std::{
    fmt::Debug,
    fs::{File, OpenOptions},
    io::ErrorKind,
    num::ParseIntError,
    os::unix::fs::MetadataExt,
    path::Path,
    sync::Arc,
};

use anyhow::{anyhow, Context};

#[derive(thiserror::Error, Debug)]
pub enum InOutError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("IO error: {0}")]
    Errno(#[from] nix::errno::Errno),
    #[error("integer parsing error: {0}")]
    ParseIntError(#[from] ParseIntError),
}

#[derive(thiserror::Error, Debug)]
#[error("could not {what} at {path:?}: {error}")]
pub struct PathIOError {
    pub what: &'static str,
    pub path: Arc<Path>,
    pub error: InOutError,
}

impl PathIOError {
    pub fn new(what: &'static str, path: &Arc<Path>, error: impl Into<InOutError>) -> Self {
        PathIOError {
            what,
            path: path.clone(),
            error: error.into(),
        }
    }
}

/// Open a file for writing in append mode, without truncating it if it
/// exists, but creating it if it doesn't exist. E.g. for writing logs.
pub fn open_append<P: AsRef<Path> + Debug>(path: P) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())
        .with_context(|| anyhow!("opening {path:?} for appending"))
}

/// Create the parent directories of `path` (if it has any).
pub fn create_parent_dirs(path: &Arc<Path>) -> Result<(), PathIOError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|error| PathIOError::new("create parent directories", path, error)),
        _ => Ok(()),
    }
}

/// Device and inode of `file`, to recognize it at a path later on.
pub fn file_identity(file: &File) -> std::io::Result<(u64, u64)> {
    let m = file.metadata()?;
    Ok((m.dev(), m.ino()))
}

/// Device and inode of whatever currently is at `path`, `None` if
/// there is nothing.
pub fn path_identity(path: &Path) -> std::io::Result<Option<(u64, u64)>> {
    match std::fs::symlink_metadata(path) {
        Ok(m) => Ok(Some((m.dev(), m.ino()))),
        Err(e) => match e.kind() {
            ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
