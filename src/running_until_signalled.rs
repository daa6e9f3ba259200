//! Minimal termination watch for code running before (or without) a
//! `SignalMultiplexer`: SIGINT makes `is_running` return false.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use signal_hook::{consts::SIGINT, SigId};

pub struct RunningUntilSignalled {
    terminated: Arc<AtomicBool>,
    id: SigId,
}

impl RunningUntilSignalled {
    pub fn new() -> std::io::Result<Self> {
        let terminated = Arc::new(AtomicBool::new(false));
        let id = signal_hook::flag::register(SIGINT, terminated.clone())?;
        Ok(RunningUntilSignalled { terminated, id })
    }

    pub fn is_running(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

impl Drop for RunningUntilSignalled {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.id);
    }
}

#[test]
fn t_stop() {
    let r = RunningUntilSignalled::new().unwrap();
    assert!(r.is_running());
    r.stop();
    assert!(!r.is_running());
}
