//! The service lifecycle: a `Service` implementation provides the
//! hooks, `run_service` sequences them around daemonization, the pid
//! file, the signal multiplexer and the persona switch.

use std::{path::Path, thread::sleep, time::Duration};

use anyhow::{anyhow, Context, Result};
use nix::{
    libc::c_int,
    sys::signal::Signal,
    unistd::{getpid, Pid},
};
use svcframe_unix::{
    daemonize::{close_stdin, daemonize, Readiness},
    persona::{switch_persona, Persona, PersonaSwitchMode},
    pid_file::{self, ScopedPidFile, SignalOutcome},
    shared_state::SharedStateError,
};
use tracing::{error, info, warn};

use crate::{
    control::protocol::ControlCommand,
    identity::ServiceIdentity,
    logging::{init_logging, LogSink},
    running_until_signalled::RunningUntilSignalled,
    service_opts::ServiceOpts,
    signal_cli::send_signal,
    signal_multiplexer::{EventHandler, SignalMultiplexer},
};

/// Help lines for the commands the service layer adds.
pub const SERVICE_HELP: &str = "\
stat           shows service statistics
monitor        returns information suitable for service monitoring
";

/// How long the default `Service::run` sleeps between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hooks called by `run_service`, in this order: `pre_daemonize`,
/// `pre_persona_switch`, `post_persona_switch`, `start`, `run`,
/// `stop`. The others are called from `ServiceContext::process`.
pub trait Service {
    /// Still in the foreground, before anything was set up.
    fn pre_daemonize(&mut self, _identity: &ServiceIdentity) -> Result<()> {
        Ok(())
    }

    /// Pid file and control sockets are in place, privileges are not
    /// dropped yet. Returns how the persona should be switched.
    fn pre_persona_switch(&mut self, _ctx: &mut ServiceContext) -> Result<PersonaSwitchMode> {
        Ok(PersonaSwitchMode::Irreversible)
    }

    fn post_persona_switch(&mut self, _ctx: &mut ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Set up the service. When daemonizing, the invoking process
    /// waits for this to finish, and exits with failure if it fails.
    fn start(&mut self, ctx: &mut ServiceContext) -> Result<()>;

    /// The main loop; the returned code becomes the process exit
    /// code. Has to call `ctx.process` regularly.
    fn run(&mut self, ctx: &mut ServiceContext) -> Result<i32>
    where
        Self: Sized,
    {
        while ctx.process(self) {
            sleep(DEFAULT_POLL_INTERVAL);
        }
        Ok(0)
    }

    /// Cleanup after `run` returned. Signals and control requests are
    /// no longer dispatched at this point.
    fn stop(&mut self, _ctx: &mut ServiceContext) {}

    /// Statistics, for SIGUSR1 (logged) and the `stat` command.
    fn stat(&mut self, out: &mut String) {
        out.push_str("Service provides no statistics.\n");
    }

    /// Appended to the generic `monitor` reply.
    fn monitor(&mut self, _out: &mut String) {}

    /// Service specific control commands, see
    /// `EventHandler::ctrl`. For `help`, append your own help lines
    /// and return `Ok(true)`.
    fn ctrl(&mut self, _cmd: &ControlCommand, _out: &mut String) -> Result<bool> {
        Ok(false)
    }

    /// The log file was reopened.
    fn log_rotated(&mut self, _path: Option<&Path>) {}

    /// A signal registered via `ServiceContext::register_signal`.
    fn signal(&mut self, signal: c_int) {
        warn!(
            "custom handling for signal {signal} was registered, but \
             the service does not implement a handler"
        );
    }
}

/// What a service gets to work with once it's set up.
pub struct ServiceContext {
    pub identity: ServiceIdentity,
    mux: SignalMultiplexer,
    log: LogSink,
    persona: Persona,
    readiness: Readiness,
}

/// Routes multiplexer events to the service.
struct Dispatch<'t> {
    service: &'t mut dyn Service,
    identity: &'t ServiceIdentity,
    log: &'t LogSink,
}

impl<'t> EventHandler for Dispatch<'t> {
    fn log_rotate(&mut self) {
        let path = self.log.path().cloned();
        info!("logrotate: {path:?}");
        if let Err(e) = self.log.reopen() {
            error!("reopening the log file: {e:#}");
            return;
        }
        info!(
            "service {}-{}: log rotated",
            self.identity.name, self.identity.version
        );
        self.service.log_rotated(path.as_deref());
    }

    fn stat(&mut self) {
        let mut out = String::new();
        self.service.stat(&mut out);
        for line in out.lines() {
            info!("{line}");
        }
    }

    fn signal(&mut self, signal: c_int) {
        self.service.signal(signal)
    }

    fn ctrl(&mut self, cmd: &ControlCommand, out: &mut String) -> Result<bool> {
        match cmd.name.as_str() {
            "stat" => {
                self.service.stat(out);
                Ok(true)
            }
            "monitor" => {
                self.identity.write_monitor(out);
                self.service.monitor(out);
                Ok(true)
            }
            "help" => {
                out.push_str(SERVICE_HELP);
                self.service.ctrl(cmd, out)?;
                Ok(true)
            }
            _ => self.service.ctrl(cmd, out),
        }
    }
}

impl ServiceContext {
    /// Handle pending events; false once the service should end.
    pub fn process(&mut self, service: &mut dyn Service) -> bool {
        let ServiceContext {
            identity, mux, log, ..
        } = self;
        !mux.process(&mut Dispatch {
            service,
            identity,
            log,
        })
    }

    /// Without processing events (see `process`).
    pub fn is_running(&self) -> bool {
        self.mux.is_running()
    }

    /// Make the service end (and all related processes, if this
    /// process is a global terminator).
    pub fn stop(&mut self) {
        self.mux.terminate();
    }

    pub fn global_terminate(&self, value: bool, pid: Option<Pid>) -> Result<bool, SharedStateError> {
        self.mux.global_terminate(value, pid)
    }

    pub fn register_signal(&mut self, signal: Signal) -> Result<()> {
        self.mux.register_signal(signal)
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    pub fn multiplexer(&mut self) -> &mut SignalMultiplexer {
        &mut self.mux
    }

    /// Fork a worker. The child does not serve the control channel and
    /// cannot report readiness.
    pub fn fork(&mut self) -> Result<Option<Pid>> {
        let res = self.mux.fork()?;
        if res.is_none() {
            self.readiness.close_in_child();
        }
        Ok(res)
    }

    /// stdin to /dev/null, stdout/stderr to the log, and tell the
    /// waiting parent that we're up.
    fn finish_daemonization(&mut self, noclose: bool) -> Result<()> {
        if !noclose {
            close_stdin()?;
            self.log.tie_stdio()?;
        }
        self.log.disable_console();
        self.readiness.notify()?;
        Ok(())
    }
}

/// Run `service` with the given options and return the exit code for
/// the process. Sets up logging from `opts.logging`.
pub fn run_service<S: Service>(
    service: &mut S,
    identity: ServiceIdentity,
    opts: &ServiceOpts,
) -> i32 {
    let sink = match LogSink::open(&opts.logging) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("{e:#}");
            return 1;
        }
    };
    if let Err(e) = init_logging(&opts.logging, &sink) {
        // Somebody installed a subscriber already, log there.
        warn!("{e:#}");
    }

    if let Some(spec) = &opts.signal {
        let Some(pidfile) = &opts.pidfile else {
            error!("pid file must be specified to send signal");
            return 1;
        };
        return send_signal(pidfile, spec);
    }

    match lifecycle(service, identity, opts, sink) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    }
}

fn lifecycle<S: Service>(
    service: &mut S,
    mut identity: ServiceIdentity,
    opts: &ServiceOpts,
    sink: LogSink,
) -> Result<i32> {
    if let Some(pidfile) = &opts.pidfile {
        if let SignalOutcome::Signalled(pid) = pid_file::signal(pidfile, None, false)? {
            error!(
                "service {} is already running with pid {pid}",
                identity.identity()
            );
            return Ok(1);
        }
    }

    service.pre_daemonize(&identity)?;

    let readiness = if opts.daemonize.daemonize {
        let watch = RunningUntilSignalled::new().context("installing SIGINT handler")?;
        let readiness = daemonize(&opts.daemonize, &|| watch.is_running())?;
        drop(watch);
        identity.update_pid();
        info!("running in background");
        readiness
    } else {
        Readiness::none()
    };

    let _pid_file = match &opts.pidfile {
        Some(path) => match ScopedPidFile::allocate(path) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("cannot allocate pid file: {e}");
                return Ok(1);
            }
        },
        None => None,
    };

    let mut mux = SignalMultiplexer::new(getpid())?;
    match (&opts.ctrl, &opts.pidfile) {
        (Some(ctrl), Some(_)) => {
            info!("using control socket at {ctrl:?}");
            mux.listen_unix(ctrl, &opts.ctrl_access())?;
        }
        (Some(_), None) => warn!("option --ctrl makes sense only together with --pidfile"),
        (None, _) => (),
    }
    if let Some(addr) = &opts.ctrl_listen {
        let secret = opts
            .ctrl_secret
            .as_deref()
            .ok_or_else(|| anyhow!("--ctrl-listen requires --ctrl-secret"))?;
        mux.listen_tcp(addr, secret)?;
    }

    let mut ctx = ServiceContext {
        identity,
        mux,
        log: sink,
        persona: Persona::unchanged(),
        readiness,
    };

    let mode = service.pre_persona_switch(&mut ctx)?;
    let log = ctx.log.clone();
    let persona = switch_persona(&opts.persona, mode, &mut |to| log.chown(to))?;
    if opts.persona.login_env {
        persona.apply_login_env()?;
    }
    ctx.persona = persona;
    service.post_persona_switch(&mut ctx)?;

    // This process terminates the whole daemon.
    if !ctx.global_terminate(true, None)? {
        warn!("could not register as global terminator");
    }

    if let Err(e) = service.start(&mut ctx) {
        error!("startup failed: {e:#}");
        return Ok(1);
    }
    if !ctx.process(service) {
        info!("terminated during startup");
        return Ok(1);
    }
    if opts.daemonize.daemonize {
        ctx.finish_daemonization(opts.daemonize.daemonize_noclose)?;
    }

    let code = match service.run(&mut ctx) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    ctx.mux.disarm();
    service.stop(&mut ctx);

    if code != 0 {
        error!("terminated with error {code}");
    } else {
        info!("normal shutdown");
    }
    Ok(code)
}
