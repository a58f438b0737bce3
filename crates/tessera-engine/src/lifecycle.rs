//! `NotStarted → Running → Stopped`, guarded by compare-and-set.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Where a server is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    /// Created, not yet started.
    NotStarted = 0,
    /// Started; ticks may run.
    Running = 1,
    /// Stopped. Terminal.
    Stopped = 2,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Stopped => "stopped",
        })
    }
}

/// A lifecycle transition was attempted from the wrong state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// `start` was called while not in `expected`.
    #[error("illegal lifecycle state: expected {expected}, found {actual}")]
    IllegalState {
        /// The state the transition requires.
        expected: LifecycleState,
        /// The state actually observed.
        actual: LifecycleState,
    },
}

/// Atomic lifecycle state machine. Safe to share between threads.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A lifecycle in [`LifecycleState::NotStarted`].
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::NotStarted as u8),
        }
    }

    /// The current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the state is [`LifecycleState::Running`].
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// `NotStarted → Running`. Exactly one caller succeeds.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.state
            .compare_exchange(
                LifecycleState::NotStarted as u8,
                LifecycleState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|actual| LifecycleError::IllegalState {
                expected: LifecycleState::NotStarted,
                actual: LifecycleState::from_u8(actual),
            })
    }

    /// `Running → NotStarted`, undoing a start that could not complete.
    ///
    /// Does nothing (and returns `false`) if a `stop` got there first.
    pub(crate) fn revert_start(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::Running as u8,
                LifecycleState::NotStarted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to [`LifecycleState::Stopped`] from either other state.
    ///
    /// Returns `true` for the one call that performed the transition;
    /// every later call returns `false` and does nothing.
    pub fn stop(&self) -> bool {
        self.state.swap(LifecycleState::Stopped as u8, Ordering::AcqRel) != LifecycleState::Stopped as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    #[test]
    fn start_then_stop() {
        let lc = Lifecycle::new();
        assert_eq!(lc.state(), LifecycleState::NotStarted);
        lc.start().unwrap();
        assert!(lc.is_running());
        assert!(lc.stop());
        assert_eq!(lc.state(), LifecycleState::Stopped);
    }

    #[test]
    fn second_start_is_illegal() {
        let lc = Lifecycle::new();
        lc.start().unwrap();
        assert_eq!(
            lc.start(),
            Err(LifecycleError::IllegalState {
                expected: LifecycleState::NotStarted,
                actual: LifecycleState::Running,
            })
        );
        assert_eq!(lc.state(), LifecycleState::Running);
    }

    #[test]
    fn stop_is_idempotent() {
        let lc = Lifecycle::new();
        lc.start().unwrap();
        assert!(lc.stop());
        assert!(!lc.stop());
        assert!(!lc.stop());
    }

    #[test]
    fn stop_before_start_forbids_start() {
        let lc = Lifecycle::new();
        assert!(lc.stop());
        assert_eq!(
            lc.start(),
            Err(LifecycleError::IllegalState {
                expected: LifecycleState::NotStarted,
                actual: LifecycleState::Stopped,
            })
        );
    }

    #[test]
    fn concurrent_start_has_one_winner() {
        let lc = Arc::new(Lifecycle::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lc = Arc::clone(&lc);
                let wins = Arc::clone(&wins);
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    gate.wait();
                    if lc.start().is_ok() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert!(lc.is_running());
    }
}
