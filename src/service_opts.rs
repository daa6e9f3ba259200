use std::path::PathBuf;

use svcframe_unix::{daemonize::DaemonizeOpts, persona::PersonaOpts};

use crate::{
    control::listener::{parse_mode, SocketAccess},
    logging::LoggingOpts,
};

/// The command line options every service understands; flatten this
/// into the program's own `clap::Parser`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ServiceOpts {
    #[clap(flatten)]
    pub daemonize: DaemonizeOpts,

    /// Path to the pid file. Prevents starting a second instance, and
    /// is how `--signal` finds the running one.
    #[clap(long)]
    pub pidfile: Option<PathBuf>,

    /// Signal to be sent to the running instance: stop, logrotate,
    /// status, stat. `stop` can be followed by `/SECONDS` to wait for
    /// the instance to end. Requires `--pidfile`.
    #[clap(short = 's', long)]
    pub signal: Option<String>,

    /// Path of the Unix-domain control socket (only used together
    /// with `--pidfile`).
    #[clap(long)]
    pub ctrl: Option<PathBuf>,

    /// Owner of the control socket.
    #[clap(long)]
    pub ctrl_user: Option<String>,

    /// Group of the control socket.
    #[clap(long)]
    pub ctrl_group: Option<String>,

    /// Permissions of the control socket, in octal (e.g. 0660).
    #[clap(long, value_parser = parse_mode)]
    pub ctrl_mode: Option<u32>,

    /// Also accept control connections via TCP on this HOST:PORT.
    /// Clients have to authenticate with `--ctrl-secret`.
    #[clap(long)]
    pub ctrl_listen: Option<String>,

    /// Shared secret for network control connections.
    #[clap(long)]
    pub ctrl_secret: Option<String>,

    #[clap(flatten)]
    pub persona: PersonaOpts,

    #[clap(flatten)]
    pub logging: LoggingOpts,
}

impl ServiceOpts {
    pub fn ctrl_access(&self) -> SocketAccess {
        SocketAccess {
            user: self.ctrl_user.clone(),
            group: self.ctrl_group.clone(),
            mode: self.ctrl_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(clap::Parser, Debug)]
    struct Opts {
        #[clap(flatten)]
        service: ServiceOpts,
    }

    #[test]
    fn t_parse() {
        let opts = Opts::try_parse_from([
            "svc",
            "-d",
            "--pidfile",
            "/run/svc.pid",
            "--ctrl",
            "/run/svc.ctrl",
            "--ctrl-mode",
            "0660",
            "-s",
            "stop/10",
            "--user",
            "nobody",
            "--log-file",
            "/var/log/svc.log",
        ])
        .unwrap()
        .service;
        assert!(opts.daemonize.daemonize);
        assert_eq!(opts.signal.as_deref(), Some("stop/10"));
        assert_eq!(opts.ctrl_access().mode, Some(0o660));
        assert_eq!(opts.persona.user.as_deref(), Some("nobody"));
        assert!(opts.logging.log_file.is_some());
        assert!(Opts::try_parse_from(["svc", "--ctrl-mode", "9"]).is_err());
    }
}
