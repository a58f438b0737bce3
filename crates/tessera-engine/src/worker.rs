//! Dispatcher worker threads.
//!
//! Each worker receives one [`WorkerTask`] per tick over its own bounded
//! crossbeam channel, drains the deferred-action queues of every
//! partition it owns (its safe point), updates those partitions, and
//! reports back on the per-tick `done` channel the dispatcher's barrier
//! waits on.
//!
//! [`WorkerSlot`] is the per-worker shared state the orchestrator reads
//! for stall reporting, padded to avoid false sharing.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tessera_core::{Domain, ErrorSink, PartitionKey, TickId, TickStart, WorkerId};

use crate::clock::monotonic_nanos;
use crate::partition::PartitionUnit;

/// Token value meaning "this thread is not a dispatcher worker".
pub(crate) const NO_WORKER: u64 = 0;

/// Counter for process-unique worker tokens.
///
/// Tokens, not [`WorkerId`]s, decide acquirable ownership: two
/// dispatchers in one process both have a worker 0.
static WORKER_TOKENS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TOKEN: Cell<u64> = const { Cell::new(NO_WORKER) };
}

/// Token of the worker running on the calling thread, or [`NO_WORKER`].
pub(crate) fn current_token() -> u64 {
    CURRENT_TOKEN.with(Cell::get)
}

/// Run `f` with the calling thread posing as the worker holding `token`.
#[cfg(test)]
pub(crate) fn with_token<R>(token: u64, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_TOKEN.with(|t| t.replace(token));
    let result = f();
    CURRENT_TOKEN.with(|t| t.set(previous));
    result
}

/// Sentinel for [`WorkerSlot::busy_tick`] meaning "idle".
const IDLE: u64 = 0;

/// Per-worker state shared between the worker thread and the orchestrator.
///
/// 128-byte alignment covers both 64-byte (x86) and 128-byte (Apple
/// M-series) cache lines; the orchestrator scans every slot while the
/// workers are writing theirs.
#[repr(align(128))]
pub(crate) struct WorkerSlot {
    id: WorkerId,
    token: u64,
    /// Tick currently being processed, or [`IDLE`].
    busy_tick: AtomicU64,
    /// Monotonic nanos when the current tick's work started.
    started_ns: AtomicU64,
    /// Number of ticks this slot has completed, across respawns.
    ticks_completed: AtomicU64,
}

// Compile-time assertion: WorkerSlot must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<WorkerSlot>();
};

impl WorkerSlot {
    /// Create an idle slot with a fresh process-unique token.
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            token: WORKER_TOKENS.fetch_add(1, Ordering::Relaxed),
            busy_tick: AtomicU64::new(IDLE),
            started_ns: AtomicU64::new(monotonic_nanos()),
            ticks_completed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    fn begin(&self, tick: TickId) {
        self.started_ns.store(monotonic_nanos(), Ordering::Release);
        self.busy_tick.store(tick.0, Ordering::Release);
    }

    fn finish(&self) {
        self.busy_tick.store(IDLE, Ordering::Release);
        self.ticks_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// The tick this worker is processing, if any.
    pub fn busy_tick(&self) -> Option<TickId> {
        match self.busy_tick.load(Ordering::Acquire) {
            IDLE => None,
            t => Some(TickId(t)),
        }
    }

    /// How long the worker has been inside its current tick.
    pub fn busy_for_ns(&self, now_ns: u64) -> Option<u64> {
        self.busy_tick()?;
        Some(now_ns.saturating_sub(self.started_ns.load(Ordering::Acquire)))
    }

    pub fn ticks_completed(&self) -> u64 {
        self.ticks_completed.load(Ordering::Relaxed)
    }
}

/// Work sent to a worker.
pub(crate) enum WorkerTask<D: Domain> {
    /// Run one tick over the given partitions, then report on `done`.
    Tick {
        start: TickStart,
        units: Arc<[Arc<PartitionUnit<D>>]>,
        done: Sender<WorkerReport>,
    },
}

/// What a worker sends back when it reaches the barrier.
#[derive(Debug, Default)]
pub(crate) struct WorkerReport {
    pub worker: Option<WorkerId>,
    /// Measured callback time per partition, in nanoseconds.
    pub costs: Vec<(PartitionKey, u64)>,
    pub entities: usize,
    pub deferred_actions: usize,
    pub failures: usize,
}

/// Spawn a worker thread bound to `slot`.
///
/// Returns the task sender; dropping it makes the worker exit.
pub(crate) fn spawn_worker<D: Domain>(
    slot: Arc<WorkerSlot>,
    sink: Arc<dyn ErrorSink>,
    name: String,
) -> io::Result<(Sender<WorkerTask<D>>, JoinHandle<()>)> {
    let (task_tx, task_rx) = crossbeam_channel::bounded(1);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(task_rx, slot, sink))?;
    Ok((task_tx, handle))
}

/// Main loop for a worker thread.
///
/// Runs until the task channel is closed (sender dropped).
pub(crate) fn worker_loop<D: Domain>(
    task_rx: Receiver<WorkerTask<D>>,
    slot: Arc<WorkerSlot>,
    sink: Arc<dyn ErrorSink>,
) {
    CURRENT_TOKEN.with(|t| t.set(slot.token()));

    while let Ok(task) = task_rx.recv() {
        match task {
            WorkerTask::Tick { start, units, done } => {
                slot.begin(start.tick);
                let report = run_tick(slot.id(), start, &units, sink.as_ref());
                slot.finish();
                // Best-effort: the barrier may have given up on us.
                let _ = done.send(report);
            }
        }
    }

    CURRENT_TOKEN.with(|t| t.set(NO_WORKER));
}

fn run_tick<D: Domain>(
    worker: WorkerId,
    start: TickStart,
    units: &[Arc<PartitionUnit<D>>],
    sink: &dyn ErrorSink,
) -> WorkerReport {
    let mut report = WorkerReport {
        worker: Some(worker),
        costs: Vec::with_capacity(units.len()),
        ..WorkerReport::default()
    };

    // Safe point: every deferred action queued against our partitions
    // runs before any partition-local mutation of this tick.
    for unit in units {
        report.deferred_actions += unit.binding().drain(sink);
    }

    for unit in units {
        let began = Instant::now();
        let outcome = unit.run(start, sink);
        report.costs.push((unit.key(), began.elapsed().as_nanos() as u64));
        report.entities += outcome.entities;
        report.failures += outcome.failures;
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tokens_are_unique() {
        let a = WorkerSlot::new(WorkerId(0));
        let b = WorkerSlot::new(WorkerId(0));
        assert_ne!(a.token(), b.token());
        assert_ne!(a.token(), NO_WORKER);
    }

    #[test]
    fn slot_alignment() {
        assert!(
            std::mem::align_of::<WorkerSlot>() >= 128,
            "WorkerSlot must be cache-line aligned (>= 128 bytes)"
        );
    }

    #[test]
    fn begin_finish_tracks_busy_tick() {
        let slot = WorkerSlot::new(WorkerId(2));
        assert_eq!(slot.busy_tick(), None);
        assert_eq!(slot.busy_for_ns(monotonic_nanos()), None);

        slot.begin(TickId(9));
        assert_eq!(slot.busy_tick(), Some(TickId(9)));
        std::thread::sleep(Duration::from_millis(2));
        let held = slot.busy_for_ns(monotonic_nanos()).unwrap();
        assert!(held >= 2_000_000, "held {held}ns");

        slot.finish();
        assert_eq!(slot.busy_tick(), None);
        assert_eq!(slot.ticks_completed(), 1);
    }

    #[test]
    fn main_thread_is_not_a_worker() {
        assert_eq!(current_token(), NO_WORKER);
    }
}
