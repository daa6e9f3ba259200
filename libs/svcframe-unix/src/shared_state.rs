//! State shared between a service process and all processes forked
//! from it: a global terminate flag, event counters, and the table of
//! processes whose termination terminates everything.
//!
//! Lives in a `MAP_SHARED` mapping of an unlinked temporary file,
//! hence must be created before forking; children inherit it. The pid
//! table is protected by a process-shared pthread mutex, everything
//! else is atomic.

use std::{
    cell::UnsafeCell,
    mem::size_of,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use memmap2::{MmapMut, MmapOptions};
use nix::{errno::Errno, libc, unistd::Pid};

/// Number of pids the global-terminator table can hold.
pub const TERMINATOR_CAPACITY: usize = 32;

/// Size of the mapping (one page on all relevant systems).
const MAPPING_SIZE: usize = 4096;

#[repr(C)]
struct Block {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    terminated: AtomicBool,
    log_rotate: AtomicU64,
    stat: AtomicU64,
    /// 0 = free slot. Only accessed with `mutex` held.
    terminators: UnsafeCell<[libc::pid_t; TERMINATOR_CAPACITY]>,
}

#[derive(thiserror::Error, Debug)]
pub enum SharedStateError {
    #[error("mapping shared memory: {0}")]
    Mmap(#[from] std::io::Error),
    #[error("{context}: {error}")]
    Mutex { context: &'static str, error: Errno },
}

fn check(rc: libc::c_int, context: &'static str) -> Result<(), SharedStateError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(SharedStateError::Mutex {
            context,
            error: Errno::from_i32(rc),
        })
    }
}

pub struct SharedControlState {
    mmap: MmapMut,
}

struct Locked<'t> {
    state: &'t SharedControlState,
}

impl<'t> Locked<'t> {
    fn terminators(&mut self) -> &mut [libc::pid_t; TERMINATOR_CAPACITY] {
        unsafe { &mut *self.state.block().terminators.get() }
    }
}

impl<'t> Drop for Locked<'t> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.state.block().mutex.get());
        }
    }
}

impl SharedControlState {
    pub fn new() -> Result<Self, SharedStateError> {
        let len = MAPPING_SIZE.max(size_of::<Block>());
        let file = tempfile::tempfile()?;
        file.set_len(len as u64)?;
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        // The file is zero filled: the flag is false, the counters are
        // 0 and all pid slots are free. Only the mutex needs
        // initialization.
        let state = SharedControlState { mmap };
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr), "pthread_mutexattr_init")?;
            let res = check(
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
                "pthread_mutexattr_setpshared",
            )
            .and_then(|()| {
                check(
                    libc::pthread_mutex_init(state.block().mutex.get(), &attr),
                    "pthread_mutex_init",
                )
            });
            libc::pthread_mutexattr_destroy(&mut attr);
            res?;
        }
        Ok(state)
    }

    fn block(&self) -> &Block {
        // Page aligned, and at least `size_of::<Block>()` long.
        unsafe { &*(self.mmap.as_ptr() as *const Block) }
    }

    fn lock(&self) -> Result<Locked<'_>, SharedStateError> {
        check(
            unsafe { libc::pthread_mutex_lock(self.block().mutex.get()) },
            "pthread_mutex_lock",
        )?;
        Ok(Locked { state: self })
    }

    pub fn is_terminated(&self) -> bool {
        self.block().terminated.load(Ordering::SeqCst)
    }

    pub fn set_terminated(&self) {
        self.block().terminated.store(true, Ordering::SeqCst);
    }

    pub fn log_rotate_count(&self) -> u64 {
        self.block().log_rotate.load(Ordering::SeqCst)
    }

    pub fn request_log_rotate(&self) {
        self.block().log_rotate.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stat_count(&self) -> u64 {
        self.block().stat.load(Ordering::SeqCst)
    }

    pub fn request_stat(&self) {
        self.block().stat.fetch_add(1, Ordering::SeqCst);
    }

    /// Add `pid` to the global terminators. Returns false (and
    /// changes nothing) if the table is full. Adding a pid that is
    /// already present is a no-op returning true.
    pub fn add_terminator(&self, pid: Pid) -> Result<bool, SharedStateError> {
        let raw = pid.as_raw();
        let mut locked = self.lock()?;
        let slots = locked.terminators();
        if slots.contains(&raw) {
            return Ok(true);
        }
        match slots.iter_mut().find(|slot| **slot == 0) {
            Some(slot) => {
                *slot = raw;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove `pid` from the global terminators, returns whether it
    /// was present.
    pub fn remove_terminator(&self, pid: Pid) -> Result<bool, SharedStateError> {
        let raw = pid.as_raw();
        let mut locked = self.lock()?;
        let mut found = false;
        for slot in locked.terminators().iter_mut() {
            if *slot == raw {
                *slot = 0;
                found = true;
            }
        }
        Ok(found)
    }

    pub fn is_terminator(&self, pid: Pid) -> Result<bool, SharedStateError> {
        let raw = pid.as_raw();
        let mut locked = self.lock()?;
        Ok(locked.terminators().contains(&raw))
    }
}

#[cfg(test)]
mod tests {
    use nix::{
        sys::wait::{waitpid, WaitStatus},
        unistd::{fork, ForkResult},
    };

    use super::*;

    #[test]
    fn t_block_fits() {
        assert!(size_of::<Block>() <= MAPPING_SIZE);
    }

    #[test]
    fn t_terminator_table() {
        let state = SharedControlState::new().unwrap();
        let a = Pid::from_raw(100);
        assert!(!state.is_terminator(a).unwrap());
        assert!(state.add_terminator(a).unwrap());
        assert!(state.add_terminator(a).unwrap());
        assert!(state.is_terminator(a).unwrap());
        assert!(state.remove_terminator(a).unwrap());
        assert!(!state.remove_terminator(a).unwrap());
        assert!(!state.is_terminator(a).unwrap());
    }

    #[test]
    fn t_full_table_is_a_no_op() {
        let state = SharedControlState::new().unwrap();
        for i in 0..TERMINATOR_CAPACITY {
            assert!(state.add_terminator(Pid::from_raw(1000 + i as i32)).unwrap());
        }
        let extra = Pid::from_raw(5000);
        assert!(!state.add_terminator(extra).unwrap());
        assert!(!state.is_terminator(extra).unwrap());
        assert!(state.is_terminator(Pid::from_raw(1000)).unwrap());
    }

    #[test]
    fn t_visible_across_fork() {
        let state = SharedControlState::new().unwrap();
        // Plain fork: the test harness runs tests in threads. The
        // child only touches atomics and the process-shared mutex.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                state.request_log_rotate();
                let ok = state.add_terminator(Pid::from_raw(4242)).unwrap_or(false);
                state.set_terminated();
                unsafe { libc::_exit(if ok { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => {
                match waitpid(child, None).unwrap() {
                    WaitStatus::Exited(_, 0) => (),
                    st => panic!("child failed: {st:?}"),
                }
                assert_eq!(state.log_rotate_count(), 1);
                assert!(state.is_terminated());
                assert!(state.is_terminator(Pid::from_raw(4242)).unwrap());
            }
        }
    }
}
