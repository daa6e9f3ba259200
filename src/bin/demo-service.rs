use std::{
    process::exit,
    thread::sleep,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use clap::Parser;
use nix::{
    libc::{self, c_int},
    sys::signal::Signal,
    unistd::{getpid, Pid},
};
use svcframe::{
    cli::{clap_styles, terminal_width},
    control::protocol::{ControlCommand, CtrlCommandError},
    identity::ServiceIdentity,
    service::{run_service, Service, ServiceContext, DEFAULT_POLL_INTERVAL},
    service_opts::ServiceOpts,
};
use svcframe_unix::{persona::PersonaSwitchMode, unix::waitpid_until_gone};
use tracing::{info, warn};

#[derive(clap::Parser, Debug)]
#[command(
    next_line_help = true,
    styles = clap_styles(),
    term_width = terminal_width(),
)]
/// Example service: answers `ping` on the control channel, logs a
/// heartbeat, and optionally runs worker processes that end together
/// with it.
struct Opts {
    #[clap(flatten)]
    service: ServiceOpts,

    /// Seconds between heartbeat log messages (0: none).
    #[clap(long, default_value = "10")]
    heartbeat: u64,

    /// Number of worker processes to fork.
    #[clap(long, default_value = "0")]
    workers: u32,

    /// Keep the start identity regainable after `--user`/`--group`.
    #[clap(long)]
    regainable: bool,

    /// Fail during startup (to see what the invoking process does).
    #[clap(long)]
    fail_start: bool,
}

struct DemoService {
    heartbeat: Option<Duration>,
    workers: u32,
    regainable: bool,
    fail_start: bool,
    worker_pids: Vec<Pid>,
    pings: u64,
    usr2: u64,
}

impl DemoService {
    fn new(opts: &Opts) -> Self {
        DemoService {
            heartbeat: (opts.heartbeat > 0).then(|| Duration::from_secs(opts.heartbeat)),
            workers: opts.workers,
            regainable: opts.regainable,
            fail_start: opts.fail_start,
            worker_pids: Vec::new(),
            pings: 0,
            usr2: 0,
        }
    }

    fn worker(&mut self, ctx: &mut ServiceContext) -> ! {
        info!("worker {} started", getpid());
        while ctx.process(self) {
            sleep(DEFAULT_POLL_INTERVAL);
        }
        info!("worker {} ends", getpid());
        unsafe { libc::_exit(0) }
    }
}

impl Service for DemoService {
    fn pre_persona_switch(&mut self, _ctx: &mut ServiceContext) -> Result<PersonaSwitchMode> {
        Ok(if self.regainable {
            PersonaSwitchMode::EffectiveAndSaved
        } else {
            PersonaSwitchMode::Irreversible
        })
    }

    fn start(&mut self, ctx: &mut ServiceContext) -> Result<()> {
        if self.fail_start {
            bail!("failing on request (--fail-start)");
        }
        ctx.register_signal(Signal::SIGUSR2)?;
        for _ in 0..self.workers {
            match ctx.fork()? {
                Some(pid) => self.worker_pids.push(pid),
                None => self.worker(ctx),
            }
        }
        info!("{} started", ctx.identity.identity());
        Ok(())
    }

    fn run(&mut self, ctx: &mut ServiceContext) -> Result<i32> {
        let mut last_heartbeat = Instant::now();
        while ctx.process(self) {
            if let Some(interval) = self.heartbeat {
                if last_heartbeat.elapsed() >= interval {
                    info!("still alive, {} pings so far", self.pings);
                    last_heartbeat = Instant::now();
                }
            }
            sleep(DEFAULT_POLL_INTERVAL);
        }
        Ok(0)
    }

    fn stop(&mut self, _ctx: &mut ServiceContext) {
        for pid in self.worker_pids.drain(..) {
            match waitpid_until_gone(pid) {
                Ok(status) => info!("worker {pid} ended with {status:?}"),
                Err(e) => warn!("waiting for worker {pid}: {e}"),
            }
        }
    }

    fn stat(&mut self, out: &mut String) {
        out.push_str(&format!(
            "pings: {}\nworkers: {}\nSIGUSR2 received: {}\n",
            self.pings,
            self.worker_pids.len(),
            self.usr2
        ));
    }

    fn monitor(&mut self, out: &mut String) {
        out.push_str(&format!("Pings: {}\n", self.pings));
    }

    fn ctrl(&mut self, cmd: &ControlCommand, out: &mut String) -> Result<bool> {
        match cmd.name.as_str() {
            "help" => out.push_str(
                "ping           answers pong\n\
                 echo ARGS      repeats ARGS\n\
                 workers        lists the worker pids\n",
            ),
            "ping" => {
                self.pings += 1;
                out.push_str("pong\n");
            }
            "echo" => {
                if cmd.args.is_empty() {
                    bail!(CtrlCommandError::new("echo needs arguments"));
                }
                out.push_str(&cmd.args.join(" "));
                out.push('\n');
            }
            "workers" => {
                for pid in &self.worker_pids {
                    out.push_str(&format!("{pid}\n"));
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn signal(&mut self, signal: c_int) {
        info!("received custom signal {signal}");
        self.usr2 += 1;
    }
}

fn main() {
    let opts = Opts::parse();
    let identity = ServiceIdentity::new("demo-service", env!("CARGO_PKG_VERSION"));
    let mut service = DemoService::new(&opts);
    exit(run_service(&mut service, identity, &opts.service));
}
