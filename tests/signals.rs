//! Raises real signals, so this is the only test in its binary.

use std::{thread::sleep, time::Duration};

use nix::{
    libc::c_int,
    sys::signal::Signal,
    unistd::getpid,
};
use signal_hook::low_level::raise;
use svcframe::signal_multiplexer::{EventHandler, SignalMultiplexer};

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

/// Signals arrive via a self-pipe; give them a few polls.
fn settle(mux: &mut SignalMultiplexer, counts: &mut Counts) -> bool {
    let mut terminated = false;
    for _ in 0..10 {
        terminated = mux.process(counts);
        sleep(Duration::from_millis(10));
    }
    terminated
}

#[test]
fn t_signals() {
    let mut mux = SignalMultiplexer::new(getpid()).unwrap();
    let mut counts = Counts::default();

    mux.register_signal(Signal::SIGUSR2).unwrap();
    assert!(mux.register_signal(Signal::SIGKILL).is_err());
    assert!(mux.register_signal(Signal::SIGHUP).is_err());

    raise(Signal::SIGHUP as c_int).unwrap();
    raise(Signal::SIGUSR1 as c_int).unwrap();
    raise(Signal::SIGUSR2 as c_int).unwrap();
    assert!(!settle(&mut mux, &mut counts));
    assert_eq!(counts.log_rotate, 1);
    assert_eq!(counts.stat, 1);
    assert_eq!(counts.signals, vec![Signal::SIGUSR2 as c_int]);
    assert_eq!(mux.shared().log_rotate_count(), 1);

    // Once disarmed, signals are no longer dispatched.
    let mut disarmed = SignalMultiplexer::new(getpid()).unwrap();
    disarmed.register_signal(Signal::SIGUSR2).unwrap();
    disarmed.disarm();
    let mut disarmed_counts = Counts::default();
    raise(Signal::SIGUSR2 as c_int).unwrap();
    raise(Signal::SIGHUP as c_int).unwrap();
    assert!(!settle(&mut disarmed, &mut disarmed_counts));
    assert!(disarmed_counts.signals.is_empty());
    assert_eq!(disarmed_counts.log_rotate, 0);
    assert_eq!(disarmed.shared().log_rotate_count(), 0);
    // The armed one still gets them.
    assert!(!settle(&mut mux, &mut counts));
    assert_eq!(counts.signals, vec![Signal::SIGUSR2 as c_int; 2]);
    assert_eq!(counts.log_rotate, 2);
    drop(disarmed);

    // Not a terminator: SIGTERM only ends this process.
    raise(Signal::SIGTERM as c_int).unwrap();
    assert!(settle(&mut mux, &mut counts));
    assert!(!mux.shared().is_terminated());

    // A terminator's SIGINT ends everybody sharing the state.
    let mut second = SignalMultiplexer::new(getpid()).unwrap();
    assert!(second.global_terminate(true, None).unwrap());
    raise(Signal::SIGINT as c_int).unwrap();
    let mut second_counts = Counts::default();
    assert!(settle(&mut second, &mut second_counts));
    assert!(second.shared().is_terminated());
}
