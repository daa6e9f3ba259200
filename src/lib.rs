//! Foundation for long running services on POSIX systems: daemonizing
//! with a readiness handshake, a pid file guarding against a second
//! instance, persona switching, signal handling, and a control channel
//! for runtime commands.
//!
//! A service implements `service::Service`, flattens
//! `service_opts::ServiceOpts` into its command line options, and
//! hands both to `service::run_service`.

pub mod cli;
pub mod control;
pub mod digest;
pub mod identity;
pub mod logging;
pub mod running_until_signalled;
pub mod service;
pub mod service_opts;
pub mod signal_cli;
pub mod signal_multiplexer;
pub mod utillib;
