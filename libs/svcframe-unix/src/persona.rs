//! Running a service under another user/group than the one it was
//! started as.

use std::{ffi::CString, fmt::Display};

use nix::{
    errno::Errno,
    unistd::{
        getegid, geteuid, getgid, getgroups, getuid, initgroups, setegid, seteuid, setgid,
        setresgid, setresuid, setuid, Gid, Group, Uid, User,
    },
};
use tracing::info;

/// A uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    pub fn effective() -> Self {
        Identity {
            uid: geteuid(),
            gid: getegid(),
        }
    }

    pub fn real() -> Self {
        Identity {
            uid: getuid(),
            gid: getgid(),
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Which ids are changed by a persona switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PersonaSwitchMode {
    /// setuid/setgid: one-way switch, the original identity can't be
    /// regained.
    #[default]
    Irreversible,
    /// seteuid/setegid: only the effective ids change, the original
    /// identity can be regained.
    Effective,
    /// Real ids are kept, effective and saved ids change: the
    /// original identity can be regained, and the new persona can
    /// signal the process.
    EffectiveAndSaved,
}

impl PersonaSwitchMode {
    pub fn is_regainable(self) -> bool {
        match self {
            PersonaSwitchMode::Irreversible => false,
            PersonaSwitchMode::Effective => true,
            PersonaSwitchMode::EffectiveAndSaved => true,
        }
    }
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct PersonaOpts {
    /// Switch the process to the given user name (also switches to
    /// the user's primary group unless `--group` is given).
    #[clap(long)]
    pub user: Option<String>,

    /// Switch the process to the given group name.
    #[clap(long)]
    pub group: Option<String>,

    /// Set HOME, USER, LOGNAME and SHELL from the password database
    /// entry of the user the service runs as.
    #[clap(long)]
    pub login_env: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum PersonaError {
    #[error("there is no user {0:?} present on the system")]
    NoSuchUser(String),
    #[error("there is no group {0:?} present on the system")]
    NoSuchGroup(String),
    #[error("unable to find passwd entry for uid {0}")]
    NoPasswdEntry(Uid),
    #[error("looking up {what}: {error}")]
    Lookup { what: &'static str, error: Errno },
    #[error("user name {0:?} contains a NUL byte")]
    InvalidName(String),
    #[error("{context} {id}: {error}")]
    Switch {
        context: &'static str,
        id: String,
        error: Errno,
    },
    #[error("persona switch mode {0:?} does not allow regaining privileges")]
    NotRegainable(PersonaSwitchMode),
}

/// The identity the service was started with, and the one it runs
/// as. Immutable once the switch is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub start: Identity,
    pub running: Identity,
    pub mode: PersonaSwitchMode,
}

/// The system calls doing the actual switch, separated out so that
/// their order can be checked without privileges.
pub trait IdSwitcher {
    fn set_gid(&mut self, mode: PersonaSwitchMode, gid: Gid) -> Result<(), Errno>;
    fn init_groups(&mut self, user: &CString, gid: Gid) -> Result<(), Errno>;
    fn set_uid(&mut self, mode: PersonaSwitchMode, uid: Uid) -> Result<(), Errno>;
}

/// The real thing.
pub struct SystemIdSwitcher;

impl IdSwitcher for SystemIdSwitcher {
    fn set_gid(&mut self, mode: PersonaSwitchMode, gid: Gid) -> Result<(), Errno> {
        match mode {
            PersonaSwitchMode::Irreversible => setgid(gid),
            PersonaSwitchMode::Effective => setegid(gid),
            PersonaSwitchMode::EffectiveAndSaved => setresgid(getgid(), gid, gid),
        }
    }

    fn init_groups(&mut self, user: &CString, gid: Gid) -> Result<(), Errno> {
        initgroups(user, gid)
    }

    fn set_uid(&mut self, mode: PersonaSwitchMode, uid: Uid) -> Result<(), Errno> {
        match mode {
            PersonaSwitchMode::Irreversible => setuid(uid),
            PersonaSwitchMode::Effective => seteuid(uid),
            PersonaSwitchMode::EffectiveAndSaved => setresuid(getuid(), uid, uid),
        }
    }
}

/// Switch to the persona configured in `opts`, using `switcher` for
/// the system calls. `before_switch` runs once the target identity
/// is known but before anything is changed (to hand over ownership of
/// files like the log file). Without user and group, nothing changes.
pub fn switch_persona_with(
    opts: &PersonaOpts,
    mode: PersonaSwitchMode,
    switcher: &mut dyn IdSwitcher,
    before_switch: &mut dyn FnMut(&Identity) -> anyhow::Result<()>,
) -> anyhow::Result<Persona> {
    let start = Identity::effective();
    let mut persona = Persona {
        start,
        running: start,
        mode,
    };
    if opts.user.is_none() && opts.group.is_none() {
        return Ok(persona);
    }
    info!(
        "trying to run under {}:{}",
        opts.user.as_deref().unwrap_or(""),
        opts.group.as_deref().unwrap_or("")
    );

    let mut user_cstring = None;
    if let Some(username) = &opts.user {
        let user = User::from_name(username)
            .map_err(|error| PersonaError::Lookup {
                what: "user",
                error,
            })?
            .ok_or_else(|| PersonaError::NoSuchUser(username.clone()))?;
        persona.running.uid = user.uid;
        persona.running.gid = user.gid;
        user_cstring = Some(
            CString::new(username.as_bytes())
                .map_err(|_| PersonaError::InvalidName(username.clone()))?,
        );
    }
    if let Some(groupname) = &opts.group {
        let group = Group::from_name(groupname)
            .map_err(|error| PersonaError::Lookup {
                what: "group",
                error,
            })?
            .ok_or_else(|| PersonaError::NoSuchGroup(groupname.clone()))?;
        persona.running.gid = group.gid;
    }

    before_switch(&persona.running)?;

    let Identity { uid, gid } = persona.running;
    info!("switching to gid {gid}");
    switcher
        .set_gid(mode, gid)
        .map_err(|error| PersonaError::Switch {
            context: "cannot switch to gid",
            id: gid.to_string(),
            error,
        })?;
    if let Some(user) = &user_cstring {
        info!("setting supplementary groups for user {user:?}");
        switcher
            .init_groups(user, gid)
            .map_err(|error| PersonaError::Switch {
                context: "cannot initialize supplementary groups for user",
                id: user.to_string_lossy().into_owned(),
                error,
            })?;
        info!("switching to uid {uid}");
        switcher
            .set_uid(mode, uid)
            .map_err(|error| PersonaError::Switch {
                context: "cannot switch to uid",
                id: uid.to_string(),
                error,
            })?;
    }
    info!("running as {}", persona.running);
    Ok(persona)
}

/// `switch_persona_with` using the real system calls.
pub fn switch_persona(
    opts: &PersonaOpts,
    mode: PersonaSwitchMode,
    before_switch: &mut dyn FnMut(&Identity) -> anyhow::Result<()>,
) -> anyhow::Result<Persona> {
    switch_persona_with(opts, mode, &mut SystemIdSwitcher, before_switch)
}

impl Persona {
    /// The persona of a process that never switched.
    pub fn unchanged() -> Self {
        let start = Identity::effective();
        Persona {
            start,
            running: start,
            mode: PersonaSwitchMode::Irreversible,
        }
    }

    pub fn is_switched(&self) -> bool {
        self.start != self.running
    }

    /// Run `f` with the effective ids of the start persona, then
    /// switch back to the running persona. Fails for the
    /// irreversible mode (unless no switch happened at all).
    pub fn run_elevated<R>(&self, f: impl FnOnce() -> R) -> Result<R, PersonaError> {
        if !self.is_switched() {
            return Ok(f());
        }
        if !self.mode.is_regainable() {
            return Err(PersonaError::NotRegainable(self.mode));
        }
        let switch = |to: Identity, uid_first: bool| -> Result<(), PersonaError> {
            let set_uid = || {
                seteuid(to.uid).map_err(|error| PersonaError::Switch {
                    context: "cannot switch effective uid to",
                    id: to.uid.to_string(),
                    error,
                })
            };
            let set_gid = || {
                setegid(to.gid).map_err(|error| PersonaError::Switch {
                    context: "cannot switch effective gid to",
                    id: to.gid.to_string(),
                    error,
                })
            };
            // Regain the uid before touching the gid, give it up
            // after.
            if uid_first {
                set_uid()?;
                set_gid()
            } else {
                set_gid()?;
                set_uid()
            }
        };
        info!("switching to persona {}", self.start);
        switch(self.start, true)?;
        let result = f();
        info!("switching back to persona {}", self.running);
        switch(self.running, false)?;
        Ok(result)
    }

    /// Set HOME, USER, LOGNAME and SHELL for the running persona.
    pub fn apply_login_env(&self) -> Result<(), PersonaError> {
        let user = User::from_uid(self.running.uid)
            .map_err(|error| PersonaError::Lookup {
                what: "passwd entry",
                error,
            })?
            .ok_or(PersonaError::NoPasswdEntry(self.running.uid))?;
        std::env::set_var("LOGNAME", &user.name);
        std::env::set_var("USER", &user.name);
        std::env::set_var("HOME", &user.dir);
        std::env::set_var("SHELL", &user.shell);
        Ok(())
    }
}

/// Current uid, gid and supplementary groups as `uid gid (g1 g2)`,
/// with `?` for groups that can't be determined.
pub fn describe_current_persona() -> String {
    let groups = match getgroups() {
        Ok(groups) => groups
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
            .join(" "),
        Err(_) => "?".into(),
    };
    format!("{} {} ({groups})", getuid(), getgid())
}
