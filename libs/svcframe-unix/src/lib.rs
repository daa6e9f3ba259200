//! Unix process plumbing for long running services: pid files,
//! daemonization, privilege switching, and state shared between a
//! process and its forked children.

pub mod daemonize;
pub mod file_lock;
pub mod file_util;
pub mod persona;
pub mod pid_file;
pub mod re_exec;
pub mod shared_state;
pub mod signal;
pub mod timestamp_formatter;
pub mod unix;
pub mod util;
