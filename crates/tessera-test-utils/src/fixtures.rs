//! Reusable domain fixtures.
//!
//! - [`CountingUnit`]: a chunk/entity that counts its updates, can be
//!   slowed down, made to fail, or made to panic.
//! - [`TestInstance`]: a world instance that counts its ticks.
//! - [`TestDomain`]: binds the two into a [`Domain`].
//! - [`BarrierProbe`]: records overlapping updates from different ticks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tessera_core::{Domain, InstanceTick, TickId, TickStart, Tickable, UpdateError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Failure {
    Never,
    Always,
    Panic,
    OnTick(TickId),
}

/// Chunk or entity that counts updates.
///
/// `touches` is free for tests to mutate through an acquirable;
/// `touches_at_update` records its value at the start of every
/// successful update, which shows when deferred actions ran.
#[derive(Debug)]
pub struct CountingUnit {
    pub updates: u64,
    pub touches: u64,
    pub touches_at_update: Vec<u64>,
    pub last_tick: Option<TickId>,
    delay: Option<Duration>,
    failure: Failure,
    probe: Option<Arc<BarrierProbe>>,
}

impl CountingUnit {
    pub fn new() -> Self {
        Self {
            updates: 0,
            touches: 0,
            touches_at_update: Vec::new(),
            last_tick: None,
            delay: None,
            failure: Failure::Never,
            probe: None,
        }
    }

    /// Every update returns an error.
    pub fn failing() -> Self {
        Self {
            failure: Failure::Always,
            ..Self::new()
        }
    }

    /// Every update panics.
    pub fn panicking() -> Self {
        Self {
            failure: Failure::Panic,
            ..Self::new()
        }
    }

    /// Only the update of `tick` returns an error.
    pub fn failing_on(tick: TickId) -> Self {
        Self {
            failure: Failure::OnTick(tick),
            ..Self::new()
        }
    }

    /// Sleep for `delay` inside every update.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report entry and exit of every update to `probe`.
    pub fn with_probe(mut self, probe: Arc<BarrierProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

impl Default for CountingUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl Tickable for CountingUnit {
    fn update(&mut self, tick: TickStart) -> Result<(), UpdateError> {
        if let Some(probe) = &self.probe {
            probe.enter(tick.tick);
        }
        let result = self.step(tick);
        if let Some(probe) = &self.probe {
            probe.exit(tick.tick);
        }
        result
    }
}

impl CountingUnit {
    fn step(&mut self, tick: TickStart) -> Result<(), UpdateError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match self.failure {
            Failure::Always => return Err(UpdateError::failed("counting unit failure")),
            Failure::OnTick(t) if t == tick.tick => {
                return Err(UpdateError::failed(format!("counting unit failure at {t}")))
            }
            Failure::Panic => panic!("counting unit panic at {}", tick.tick),
            _ => {}
        }
        self.updates += 1;
        self.touches_at_update.push(self.touches);
        self.last_tick = Some(tick.tick);
        Ok(())
    }
}

/// World instance that counts its ticks.
#[derive(Debug, Default)]
pub struct TestInstance {
    pub ticks: u64,
    pub fail: bool,
}

impl TestInstance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every tick returns an error.
    pub fn failing() -> Self {
        Self {
            ticks: 0,
            fail: true,
        }
    }
}

impl InstanceTick for TestInstance {
    fn tick(&mut self, _tick: TickStart) -> Result<(), UpdateError> {
        if self.fail {
            return Err(UpdateError::failed("test instance failure"));
        }
        self.ticks += 1;
        Ok(())
    }
}

/// [`Domain`] made of [`TestInstance`] and [`CountingUnit`]s.
#[derive(Debug)]
pub struct TestDomain;

impl Domain for TestDomain {
    type Instance = TestInstance;
    type Chunk = CountingUnit;
    type Entity = CountingUnit;
}

// ── BarrierProbe ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ProbeState {
    tick: TickId,
    active: usize,
    entries: BTreeMap<TickId, usize>,
    violations: Vec<String>,
}

/// Detects an update of tick N+1 starting while an update of tick N is
/// still running, or an update arriving for a tick already left behind.
#[derive(Debug, Default)]
pub struct BarrierProbe {
    state: Mutex<ProbeState>,
}

impl BarrierProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, tick: TickId) {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if tick > s.tick {
            if s.active > 0 {
                let msg = format!("{tick} entered while {} update(s) of {} active", s.active, s.tick);
                s.violations.push(msg);
            }
            s.tick = tick;
        } else if tick < s.tick {
            let msg = format!("{tick} entered after {} began", s.tick);
            s.violations.push(msg);
        }
        s.active += 1;
        *s.entries.entry(tick).or_default() += 1;
    }

    pub fn exit(&self, _tick: TickId) {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        s.active = s.active.saturating_sub(1);
    }

    /// Updates entered for `tick`.
    pub fn entries(&self, tick: TickId) -> usize {
        let s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        s.entries.get(&tick).copied().unwrap_or(0)
    }

    pub fn violations(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .violations
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(n: u64) -> TickStart {
        TickStart::new(TickId(n), 0)
    }

    #[test]
    fn counting_unit_counts() {
        let mut u = CountingUnit::new();
        u.touches = 2;
        u.update(at(1)).unwrap();
        u.update(at(2)).unwrap();
        assert_eq!(u.updates, 2);
        assert_eq!(u.touches_at_update, vec![2, 2]);
        assert_eq!(u.last_tick, Some(TickId(2)));
    }

    #[test]
    fn failing_on_fails_once_without_counting() {
        let mut u = CountingUnit::failing_on(TickId(1));
        assert!(u.update(at(1)).is_err());
        assert!(u.update(at(2)).is_ok());
        assert_eq!(u.updates, 1);
    }

    #[test]
    fn probe_flags_overlap() {
        let probe = BarrierProbe::new();
        probe.enter(TickId(1));
        probe.enter(TickId(2));
        assert_eq!(probe.violations().len(), 1);
        probe.exit(TickId(1));
        probe.exit(TickId(2));
        probe.enter(TickId(3));
        assert_eq!(probe.violations().len(), 1);
        assert_eq!(probe.entries(TickId(1)), 1);
    }
}
