//! Process-wide initialization guard.
//!
//! Host lifecycle hooks may fire more than once per process (scene load,
//! editor load, ...). The guard makes sure the bridge startup sequence runs
//! exactly once. A failed attempt releases the guard so a later hook can retry.

use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// The guard shared by every bridge in this process.
pub static PROCESS_INIT: InitGuard = InitGuard::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Running,
    Done,
}

#[derive(Debug)]
pub struct InitGuard {
    state: AtomicU8,
}

impl InitGuard {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Claim the startup sequence. `None` if it is running or already done.
    pub fn try_begin(&self) -> Option<InitTicket<'_>> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InitTicket {
                guard: self,
                completed: false,
            })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    pub fn state(&self) -> GuardState {
        match self.state.load(Ordering::Acquire) {
            IDLE => GuardState::Idle,
            RUNNING => GuardState::Running,
            _ => GuardState::Done,
        }
    }
}

impl Default for InitGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while the startup sequence runs.
///
/// `complete()` marks the guard done for the rest of the process. Dropping
/// the ticket without completing returns the guard to idle.
#[must_use]
pub struct InitTicket<'a> {
    guard: &'a InitGuard,
    completed: bool,
}

impl InitTicket<'_> {
    pub fn complete(mut self) {
        self.guard.state.store(DONE, Ordering::Release);
        self.completed = true;
    }
}

impl Drop for InitTicket<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.guard.state.store(IDLE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_winner() {
        let guard = InitGuard::new();
        let ticket = guard.try_begin().unwrap();
        assert_eq!(guard.state(), GuardState::Running);
        assert!(guard.try_begin().is_none());

        ticket.complete();
        assert!(guard.is_initialized());
        assert!(guard.try_begin().is_none());
    }

    #[test]
    fn test_abandoned_ticket_releases_guard() {
        let guard = InitGuard::new();
        {
            let _ticket = guard.try_begin().unwrap();
        }
        assert_eq!(guard.state(), GuardState::Idle);
        assert!(guard.try_begin().is_some());
    }

    #[test]
    fn test_racing_threads_run_once() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        static GUARD: InitGuard = InitGuard::new();
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    if let Some(ticket) = GUARD.try_begin() {
                        RUNS.fetch_add(1, Ordering::SeqCst);
                        ticket.complete();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
        assert!(GUARD.is_initialized());
    }
}
