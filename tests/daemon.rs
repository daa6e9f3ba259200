//! Runs the `demo-service` binary.

use std::{
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread::sleep,
    time::{Duration, Instant},
};

use nix::{sys::signal::kill, unistd::Pid};
use svcframe::control::client::{ctrl_client_for, CtrlClientError};
use tempfile::TempDir;

struct Paths {
    _dir: TempDir,
    pidfile: PathBuf,
    ctrl: PathBuf,
    log: PathBuf,
}

impl Paths {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Paths {
            pidfile: dir.path().join("demo.pid"),
            ctrl: dir.path().join("demo.ctrl"),
            log: dir.path().join("log/demo.log"),
            _dir: dir,
        }
    }

    fn demo(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_demo-service"));
        cmd.arg("--pidfile")
            .arg(&self.pidfile)
            .arg("--heartbeat")
            .arg("0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn signal(&self, spec: &str) -> i32 {
        self.demo()
            .args(["--signal", spec])
            .status()
            .unwrap()
            .code()
            .unwrap()
    }

    fn ctrl(&self, command: &str) -> Result<Vec<String>, CtrlClientError> {
        ctrl_client_for(self.ctrl.to_str().unwrap())?.command(command)
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timeout waiting for {what}");
        sleep(Duration::from_millis(20));
    }
}

/// A bare `stop` only sends SIGTERM; the pid file goes away once the
/// instance has shut down.
fn stop(paths: &Paths, spec: &str, child: Option<Child>) {
    assert_eq!(paths.signal(spec), 0);
    wait_for("pid file removal", || !paths.pidfile.exists());
    if let Some(mut child) = child {
        assert!(child.wait().unwrap().success());
    }
    assert_eq!(paths.signal("status"), 3);
}

#[test]
fn t_foreground() {
    let paths = Paths::new();
    let child = paths
        .demo()
        .arg("--ctrl")
        .arg(&paths.ctrl)
        .spawn()
        .unwrap();
    wait_for("control socket", || paths.ctrl.exists());

    assert_eq!(paths.signal("status"), 0);
    assert_eq!(paths.ctrl("ping").unwrap(), vec!["pong"]);
    assert_eq!(paths.ctrl("echo a  b").unwrap(), vec!["a b"]);
    match paths.ctrl("echo") {
        Err(CtrlClientError::Command(e)) => assert_eq!(e.0, "echo needs arguments"),
        other => panic!("{other:?}"),
    }
    let monitor = paths.ctrl("monitor").unwrap();
    assert!(monitor[0].starts_with("Identity: demo-service/"));
    assert_eq!(monitor[1], "Name: demo-service");
    assert!(monitor.iter().any(|l| l == "Pings: 1"));
    let stat = paths.ctrl("stat").unwrap();
    assert_eq!(stat[0], "pings: 1");
    let help = paths.ctrl("help").unwrap();
    for command in ["logrotate", "stat", "monitor", "ping"] {
        assert!(help.iter().any(|l| l.starts_with(command)), "{command}");
    }

    // A second instance refuses to start.
    let second = paths.demo().status().unwrap();
    assert_eq!(second.code(), Some(1));

    assert_eq!(paths.signal("logrotate"), 0);
    assert_eq!(paths.signal("stat"), 0);
    assert_eq!(paths.signal("bogus"), 3);
    stop(&paths, "stop/10", Some(child));
    assert!(!paths.ctrl.exists());
}

#[test]
fn t_daemon() {
    let paths = Paths::new();
    let status = paths
        .demo()
        .arg("-d")
        .arg("--ctrl")
        .arg(&paths.ctrl)
        .arg("--log-file")
        .arg(&paths.log)
        .arg("--workers")
        .arg("2")
        .status()
        .unwrap();
    assert!(status.success());

    // The invoking process only returns once the daemon is ready.
    assert_eq!(paths.signal("status"), 0);
    assert_eq!(paths.ctrl("ping").unwrap(), vec!["pong"]);
    let workers: Vec<Pid> = paths
        .ctrl("workers")
        .unwrap()
        .iter()
        .map(|l| Pid::from_raw(l.parse().unwrap()))
        .collect();
    assert_eq!(workers.len(), 2);

    let log = std::fs::read_to_string(&paths.log).unwrap();
    assert!(log.contains("demo-service/"), "{log}");

    stop(&paths, "stop", None);
    for pid in workers {
        assert!(kill(pid, None).is_err(), "worker {pid} still there");
    }
    let log = std::fs::read_to_string(&paths.log).unwrap();
    assert!(log.contains("normal shutdown"), "{log}");
}

#[test]
fn t_failed_start() {
    let paths = Paths::new();
    let status = paths
        .demo()
        .args(["-d", "--fail-start"])
        .status()
        .unwrap();
    assert!(!status.success());
    assert!(matches!(paths.signal("status"), 1 | 3));
}

#[test]
fn t_signal_without_instance() {
    let paths = Paths::new();
    assert_eq!(paths.signal("logrotate"), 1);
    assert_eq!(paths.signal("stop"), 1);
    assert_eq!(paths.signal("stop/1"), 1);
    assert_eq!(paths.signal("status"), 3);

    let no_pidfile = Command::new(env!("CARGO_BIN_EXE_demo-service"))
        .args(["--signal", "status"])
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(no_pidfile.code(), Some(1));
}

#[test]
fn t_log_file_must_be_writable() {
    let paths = Paths::new();
    let status = paths
        .demo()
        .arg("--log-file")
        .arg(Path::new("/dev/null/impossible.log"))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}
