use std::{
    fmt::Write,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Local, Utc};
use nix::unistd::{getpid, getppid, Pid};
use svcframe_unix::{persona::describe_current_persona, util::format_duration_secs};

/// Git hash of the build, empty if it couldn't be determined.
pub const GIT_HASH: &str = env!("SVCFRAME_GIT_HASH");

/// Who the service is, and since when it's running.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub name: String,
    pub version: String,
    pub githash: String,
    pub pid: Pid,
    pub up_since: SystemTime,
}

impl ServiceIdentity {
    pub fn new(name: &str, version: &str) -> Self {
        ServiceIdentity {
            name: name.into(),
            version: version.into(),
            githash: GIT_HASH.into(),
            pid: getpid(),
            up_since: SystemTime::now(),
        }
    }

    /// `name/version/githash` (without the last part if the hash is
    /// unknown).
    pub fn identity(&self) -> String {
        if self.githash.is_empty() {
            format!("{}/{}", self.name, self.version)
        } else {
            format!("{}/{}/{}", self.name, self.version, self.githash)
        }
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.up_since)
            .unwrap_or_default()
    }

    /// After forking the daemon process.
    pub fn update_pid(&mut self) {
        self.pid = getpid();
    }

    /// The generic part of the `monitor` reply.
    pub fn write_monitor(&self, out: &mut String) {
        let local: DateTime<Local> = self.up_since.into();
        let utc: DateTime<Utc> = self.up_since.into();
        let uptime = self.uptime().as_secs();
        _ = write!(
            out,
            "Identity: {}\n\
             Name: {}\n\
             Version: {}\n\
             Pid: {} ({})\n\
             Persona: {}\n\
             Up-Since: {} ({} GMT)\n\
             Uptime: {uptime} {}\n",
            self.identity(),
            self.name,
            self.version,
            getpid(),
            getppid(),
            describe_current_persona(),
            local.format("%Y-%m-%d %H:%M:%S"),
            utc.format("%Y-%m-%d %H:%M:%S"),
            format_duration_secs(uptime),
        );
    }
}
