//! Monotonic time source.

use std::sync::OnceLock;
use std::time::Instant;

use tessera_core::Clock;

/// [`Clock`] backed by [`Instant`], measured from a process-local origin.
///
/// All engine-internal timestamps (worker stall detection, tick loop
/// budgets) use [`monotonic_nanos`], so every `MonotonicClock` agrees
/// with them.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn nanos(&self) -> u64 {
        monotonic_nanos()
    }
}

/// Returns monotonic nanoseconds since an arbitrary process-local epoch.
///
/// Uses `OnceLock<Instant>` to lazily initialise a baseline. NOT wall-clock
/// time, only for relative duration comparisons. The first call returns a
/// value close to zero.
pub fn monotonic_nanos() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    Instant::now().duration_since(*origin).as_nanos() as u64
}
