//! The reactor of a service process: OS signals, the control channel,
//! and the termination and event state shared with forked children.
//! Nothing here blocks; `process` is meant to be called from the
//! service's own loop.

use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::{
    libc::c_int,
    sys::signal::Signal,
    unistd::{getpid, Pid},
};
use signal_hook::{
    consts::{FORBIDDEN, SIGHUP, SIGINT, SIGTERM, SIGUSR1},
    iterator::Signals,
};
use svcframe_unix::{
    shared_state::{SharedControlState, SharedStateError},
    unix::easy_fork,
};
use tracing::{debug, info, warn};

use crate::control::{
    connection::CommandHandler,
    listener::{ControlServer, SocketAccess},
    protocol::{not_implemented, ControlCommand, BUILTIN_HELP},
};

const DEFAULT_SIGNALS: [c_int; 4] = [SIGTERM, SIGINT, SIGHUP, SIGUSR1];

/// Receives what the multiplexer picked up. All methods have
/// defaults, so that a handler only implements what it cares about.
pub trait EventHandler {
    /// Called once per poll in which the log rotation counter moved.
    fn log_rotate(&mut self) {}

    /// Like `log_rotate`, for the statistics counter; only called in
    /// the main process.
    fn stat(&mut self) {}

    /// A signal registered via `SignalMultiplexer::register_signal`
    /// arrived.
    fn signal(&mut self, signal: c_int) {
        warn!("unhandled signal {signal}");
    }

    /// Commands that aren't built in. Return `Ok(false)` for commands
    /// you don't know. Also called with `help`, after the built-in
    /// help lines were written to `out`.
    fn ctrl(&mut self, _cmd: &ControlCommand, _out: &mut String) -> Result<bool> {
        Ok(false)
    }
}

/// For code that only needs the termination state.
pub struct NoEvents;

impl EventHandler for NoEvents {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPhase {
    Prepare,
    Parent,
    Child,
}

/// Everything but the control server, so that the built-in command
/// handler can borrow it while the server is running.
struct MuxCore {
    main_pid: Pid,
    shared: SharedControlState,
    local_terminated: bool,
    /// Set by `disarm`, nothing is dispatched anymore.
    disarmed: bool,
    seen_log_rotate: u64,
    seen_stat: u64,
    signals: Signals,
    /// Extra signals beyond the default set, forwarded to the handler.
    registered: Vec<c_int>,
}

impl MuxCore {
    fn new_signals(registered: &[c_int]) -> Result<Signals> {
        let mut all = DEFAULT_SIGNALS.to_vec();
        all.extend_from_slice(registered);
        Signals::new(&all).context("installing signal handlers")
    }

    /// Local termination, escalated to all related processes if we are
    /// a global terminator.
    fn terminate(&mut self, why: &str) {
        self.local_terminated = true;
        let pid = getpid();
        match self.shared.is_terminator(pid) {
            Ok(true) => {
                info!("{why}: global termination");
                self.shared.set_terminated();
            }
            Ok(false) => info!("{why}: termination"),
            Err(e) => {
                warn!("{why}: {e}, terminating locally only");
            }
        }
    }

    fn drain_signals(&mut self, handler: &mut dyn EventHandler) {
        let pending: Vec<c_int> = self.signals.pending().collect();
        for signal in pending {
            match signal {
                SIGTERM => self.terminate("received SIGTERM"),
                SIGINT => self.terminate("received SIGINT"),
                SIGHUP => self.shared.request_log_rotate(),
                SIGUSR1 => self.shared.request_stat(),
                0 => (),
                s if self.registered.contains(&s) => handler.signal(s),
                s => debug!("ignoring unregistered signal {s}"),
            }
        }
    }

    fn check_counters(&mut self, handler: &mut dyn EventHandler) {
        let log_rotate = self.shared.log_rotate_count();
        if log_rotate != self.seen_log_rotate {
            self.seen_log_rotate = log_rotate;
            handler.log_rotate();
        }
        let stat = self.shared.stat_count();
        if stat != self.seen_stat {
            self.seen_stat = stat;
            if getpid() == self.main_pid {
                handler.stat();
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.local_terminated || self.shared.is_terminated()
    }
}

/// Adds the built-in commands in front of an `EventHandler`.
struct Builtins<'t> {
    core: &'t mut MuxCore,
    handler: &'t mut dyn EventHandler,
}

impl<'t> CommandHandler for Builtins<'t> {
    fn handle(&mut self, cmd: &ControlCommand, out: &mut String) -> Result<()> {
        match cmd.name.as_str() {
            "help" => {
                out.push_str(BUILTIN_HELP);
                self.handler.ctrl(cmd, out)?;
            }
            "logrotate" => {
                self.core.shared.request_log_rotate();
                out.push_str("log rotation scheduled\n");
            }
            "terminate" => {
                self.core.terminate("terminate command received");
                out.push_str("termination scheduled, bye\n");
            }
            name => {
                if !self.handler.ctrl(cmd, out)? {
                    out.clear();
                    return Err(not_implemented(name).into());
                }
            }
        }
        Ok(())
    }
}

pub struct SignalMultiplexer {
    core: MuxCore,
    control: ControlServer,
}

impl SignalMultiplexer {
    /// `main_pid` is the process that handles statistics requests
    /// (usually `getpid()` of the daemon). Creates the shared state,
    /// so this has to happen before forking any children that should
    /// share it.
    pub fn new(main_pid: Pid) -> Result<Self> {
        let shared = SharedControlState::new()?;
        let signals = MuxCore::new_signals(&[])?;
        Ok(SignalMultiplexer {
            core: MuxCore {
                main_pid,
                seen_log_rotate: shared.log_rotate_count(),
                seen_stat: shared.stat_count(),
                shared,
                local_terminated: false,
                disarmed: false,
                signals,
                registered: Vec::new(),
            },
            control: ControlServer::new(),
        })
    }

    pub fn main_pid(&self) -> Pid {
        self.core.main_pid
    }

    pub fn shared(&self) -> &SharedControlState {
        &self.core.shared
    }

    /// Forward `signal` to `EventHandler::signal`.
    pub fn register_signal(&mut self, signal: Signal) -> Result<()> {
        let signo = signal as c_int;
        if FORBIDDEN.contains(&signo) {
            bail!("signal {signal} cannot be handled");
        }
        if DEFAULT_SIGNALS.contains(&signo) {
            bail!("signal {signal} is handled by the multiplexer itself");
        }
        if !self.core.registered.contains(&signo) {
            self.core
                .signals
                .add_signal(signo)
                .with_context(|| format!("installing handler for {signal}"))?;
            self.core.registered.push(signo);
        }
        Ok(())
    }

    pub fn listen_unix(&mut self, path: &Path, access: &SocketAccess) -> Result<()> {
        self.control.bind_unix(path, access)
    }

    pub fn listen_tcp(&mut self, addr: &str, secret: &str) -> Result<std::net::SocketAddr> {
        self.control.bind_tcp(addr, secret)
    }

    /// Handle pending signals and control requests, then fire the
    /// counter callbacks. Returns true once this process should
    /// terminate.
    pub fn process(&mut self, handler: &mut dyn EventHandler) -> bool {
        let SignalMultiplexer { core, control } = self;
        if core.disarmed {
            return core.is_terminated();
        }
        core.drain_signals(handler);
        if !control.is_empty() {
            control.process(&mut Builtins {
                core: &mut *core,
                handler: &mut *handler,
            });
        }
        core.check_counters(handler);
        core.is_terminated()
    }

    /// Stop dispatching: pending and future signals are dropped, and
    /// the control sockets are closed. The termination state is still
    /// reported by `process` and `is_running`. Called when the service
    /// starts shutting down.
    pub fn disarm(&mut self) {
        if !self.core.disarmed {
            debug!("disarming signal multiplexer");
            self.core.disarmed = true;
            self.core.signals.handle().close();
            self.control.close();
        }
    }

    pub fn is_disarmed(&self) -> bool {
        self.core.disarmed
    }

    pub fn is_running(&self) -> bool {
        !self.core.is_terminated()
    }

    /// Terminate this process on its next `process` call, and all
    /// related processes if it is a global terminator.
    pub fn terminate(&mut self) {
        self.core.terminate("termination requested");
    }

    /// Make `pid` (default: this process) a global terminator, or stop
    /// it from being one. Returns false if the table is full.
    pub fn global_terminate(
        &self,
        value: bool,
        pid: Option<Pid>,
    ) -> Result<bool, SharedStateError> {
        let pid = pid.unwrap_or_else(getpid);
        if value {
            let added = self.core.shared.add_terminator(pid)?;
            if !added {
                warn!("global terminator table is full, not adding pid {pid}");
            }
            Ok(added)
        } else {
            self.core.shared.remove_terminator(pid)?;
            Ok(true)
        }
    }

    /// To be called around forking. In the child, signals are
    /// delivered to a fresh reactor, and the control channel is left
    /// to the parent.
    pub fn at_fork(&mut self, phase: ForkPhase) -> Result<()> {
        match phase {
            ForkPhase::Prepare | ForkPhase::Parent => Ok(()),
            ForkPhase::Child => {
                self.core.signals.handle().close();
                self.core.signals = MuxCore::new_signals(&self.core.registered)?;
                self.control.stop_accepting();
                Ok(())
            }
        }
    }

    /// `easy_fork` with the `at_fork` calls done.
    pub fn fork(&mut self) -> Result<Option<Pid>> {
        self.at_fork(ForkPhase::Prepare)?;
        match easy_fork()? {
            Some(pid) => {
                self.at_fork(ForkPhase::Parent)?;
                Ok(Some(pid))
            }
            None => {
                self.at_fork(ForkPhase::Child)?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::CtrlCommandError;

    #[derive(Default)]
    struct Counts {
        log_rotate: u32,
        stat: u32,
        signals: Vec<c_int>,
    }

    impl EventHandler for Counts {
        fn log_rotate(&mut self) {
            self.log_rotate += 1;
        }
        fn stat(&mut self) {
            self.stat += 1;
        }
        fn signal(&mut self, signal: c_int) {
            self.signals.push(signal);
        }
    }

    #[test]
    fn t_counter_edges_fire_once_per_poll() {
        let mut mux = SignalMultiplexer::new(getpid()).unwrap();
        let mut counts = Counts::default();
        assert!(!mux.process(&mut counts));
        assert_eq!(counts.log_rotate, 0);
        mux.shared().request_log_rotate();
        mux.shared().request_log_rotate();
        mux.shared().request_stat();
        assert!(!mux.process(&mut counts));
        assert_eq!((counts.log_rotate, counts.stat), (1, 1));
        mux.process(&mut counts);
        assert_eq!((counts.log_rotate, counts.stat), (1, 1));
    }

    #[test]
    fn t_stat_only_in_main_process() {
        let mut mux = SignalMultiplexer::new(Pid::from_raw(1)).unwrap();
        let mut counts = Counts::default();
        mux.shared().request_stat();
        mux.shared().request_log_rotate();
        mux.process(&mut counts);
        assert_eq!((counts.log_rotate, counts.stat), (1, 0));
    }

    #[test]
    fn t_local_versus_global_terminate() {
        let mut mux = SignalMultiplexer::new(getpid()).unwrap();
        mux.terminate();
        assert!(mux.process(&mut NoEvents));
        assert!(!mux.shared().is_terminated());

        let mut mux = SignalMultiplexer::new(getpid()).unwrap();
        assert!(mux.global_terminate(true, None).unwrap());
        mux.terminate();
        assert!(mux.shared().is_terminated());
        assert!(mux.global_terminate(false, None).unwrap());
        assert!(!mux.shared().is_terminator(getpid()).unwrap());
    }

    #[test]
    fn t_builtin_commands() {
        let mut mux = SignalMultiplexer::new(getpid()).unwrap();
        let mut counts = Counts::default();
        let SignalMultiplexer { core, .. } = &mut mux;
        let mut builtins = Builtins {
            core,
            handler: &mut counts,
        };
        let mut out = String::new();
        let cmd = ControlCommand::parse("logrotate").unwrap();
        builtins.handle(&cmd, &mut out).unwrap();
        assert_eq!(out, "log rotation scheduled\n");
        let cmd = ControlCommand::parse("foo").unwrap();
        let err = builtins.handle(&cmd, &mut String::new()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CtrlCommandError>(),
            Some(&CtrlCommandError::new("command <foo> not implemented"))
        );
        let cmd = ControlCommand::parse("terminate").unwrap();
        builtins.handle(&cmd, &mut String::new()).unwrap();
        assert!(mux.process(&mut counts));
        assert_eq!(counts.log_rotate, 1);
    }

    #[test]
    fn t_disarm_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ctrl.sock");
        let mut mux = SignalMultiplexer::new(getpid()).unwrap();
        mux.listen_unix(&socket, &SocketAccess::default()).unwrap();
        let mut counts = Counts::default();

        mux.disarm();
        assert!(mux.is_disarmed());
        assert!(!socket.exists());
        assert!(std::os::unix::net::UnixStream::connect(&socket).is_err());

        mux.shared().request_log_rotate();
        assert!(!mux.process(&mut counts));
        assert_eq!(counts.log_rotate, 0);

        // Termination is still reported.
        mux.terminate();
        assert!(mux.process(&mut counts));
        assert!(!mux.is_running());
        mux.disarm();
    }
}
