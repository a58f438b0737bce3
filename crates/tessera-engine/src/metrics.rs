//! Per-tick timing and counters.
//!
//! [`TickMetrics`] is the detailed record kept by the ticker after every
//! tick; [`TickMonitor`] is the small event published to observers.

use tessera_core::TickId;

use crate::dispatcher::{DispatchStats, RefreshStats};

/// Timing and counters collected during a single tick.
///
/// All durations are in microseconds, measured with the ticker's clock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickMetrics {
    /// The tick these metrics describe.
    pub tick: TickId,
    /// Time for the entire tick, in microseconds.
    pub total_us: u64,
    /// Phase 1: tick-start scheduled tasks.
    pub scheduler_us: u64,
    /// Phase 2: intake inboxes.
    pub intake_us: u64,
    /// Phase 3: instance callbacks.
    pub world_us: u64,
    /// Phase 4a: dispatcher barrier.
    pub dispatch_us: u64,
    /// Phase 4b: membership refresh and rebalancing.
    pub refresh_us: u64,
    /// Phase 5: tick-end scheduled tasks.
    pub tick_end_us: u64,
    /// Phase 6: outbound flush.
    pub flush_us: u64,
    /// Scheduled tasks run across both scheduler phases.
    pub scheduled_tasks: usize,
    /// Inbound items handled.
    pub intake_items: usize,
    /// Instances ticked.
    pub instances: usize,
    /// Instance callbacks that failed.
    pub instance_failures: usize,
    /// Dispatcher barrier counters.
    pub dispatch: DispatchStats,
    /// Refresh counters.
    pub refresh: RefreshStats,
    /// Outbound items delivered.
    pub flushed: usize,
    /// Time threads spent blocked on contended acquirables this tick, in
    /// nanoseconds.
    pub acquisition_ns: u64,
}

/// Monitoring event published to observers once per tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TickMonitor {
    /// The tick just completed.
    pub tick: TickId,
    /// Duration of the tick, in milliseconds, measured by the ticker's
    /// clock from entry to `Ticker::tick`, not from the tick's
    /// `nano_time`.
    pub tick_time_ms: f64,
    /// Acquisition-blocked time accumulated during the tick, in milliseconds.
    pub acquisition_time_ms: f64,
}

impl TickMonitor {
    pub(crate) fn from_metrics(metrics: &TickMetrics) -> Self {
        Self {
            tick: metrics.tick,
            tick_time_ms: metrics.total_us as f64 / 1_000.0,
            acquisition_time_ms: metrics.acquisition_ns as f64 / 1_000_000.0,
        }
    }
}
