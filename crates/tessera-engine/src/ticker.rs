//! The single-threaded tick orchestrator.
//!
//! [`Ticker`] owns every process-wide manager the tick touches (the
//! scheduler, intake inboxes, world instances, the dispatcher, flush
//! targets and observers) and sequences them once per [`Ticker::tick`]:
//!
//! 1. tick-start scheduled tasks
//! 2. intake
//! 3. world instances
//! 4. dispatcher barrier, then membership refresh and rebalancing
//! 5. tick-end scheduled tasks
//! 6. flush
//! 7. monitoring
//!
//! Every phase finishes before the next begins. Failures are isolated
//! per unit and reported to the error sink; no phase is skipped because
//! a sibling unit failed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tessera_core::{
    Clock, Domain, EngineError, ErrorSink, InstanceId, InstanceTick, TickId, TickStart, UnitKind, UpdateError,
};
use tracing::{debug, trace_span};

use crate::clock::MonotonicClock;
use crate::config::{ConfigError, EngineConfig};
use crate::dispatcher::ThreadDispatcher;
use crate::flush::Flush;
use crate::intake::Inbox;
use crate::isolate::{catch, run_isolated};
use crate::metrics::{TickMetrics, TickMonitor};
use crate::scheduler::{SchedulePhase, Scheduler};
use crate::snapshot::{ServerSnapshot, SnapshotCoordinator, SnapshotUpdater};

// ── TickObserver ───────────────────────────────────────────────────

/// Receives the monitoring event published at the end of every tick.
pub trait TickObserver: Send + 'static {
    /// Called on the orchestrator after phase 6.
    fn on_tick(&mut self, monitor: &TickMonitor) -> Result<(), UpdateError>;
}

impl<F> TickObserver for F
where
    F: FnMut(&TickMonitor) + Send + 'static,
{
    fn on_tick(&mut self, monitor: &TickMonitor) -> Result<(), UpdateError> {
        self(monitor);
        Ok(())
    }
}

// ── Ticker ─────────────────────────────────────────────────────────

fn elapsed_us(from: u64, to: u64) -> u64 {
    to.saturating_sub(from) / 1_000
}

/// Orchestrates one tick at a time across every collaborator.
///
/// `Ticker` is `Send` but not `Sync`: it lives on exactly one thread,
/// either the embedder's or the tick driver's.
pub struct Ticker<D: Domain> {
    dispatcher: ThreadDispatcher<D>,
    scheduler: Scheduler,
    instances: IndexMap<InstanceId, D::Instance>,
    inboxes: Vec<Inbox>,
    flush_targets: Vec<Box<dyn Flush>>,
    observers: Vec<Box<dyn TickObserver>>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ErrorSink>,
    current_tick: TickId,
    last_metrics: TickMetrics,
}

impl<D: Domain> Ticker<D> {
    /// Create a ticker and spawn its dispatcher's worker pool.
    pub fn new(config: &EngineConfig, sink: Arc<dyn ErrorSink>) -> Result<Self, ConfigError> {
        let dispatcher = ThreadDispatcher::new(config, Arc::clone(&sink))?;
        Ok(Self {
            dispatcher,
            scheduler: Scheduler::new(),
            instances: IndexMap::new(),
            inboxes: Vec::new(),
            flush_targets: Vec::new(),
            observers: Vec::new(),
            clock: Arc::new(MonotonicClock),
            sink,
            current_tick: TickId(0),
            last_metrics: TickMetrics::default(),
        })
    }

    /// Replace the clock used for phase timings.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ── Collaborators ──────────────────────────────────────────────

    /// Register a world instance. It is ticked from the next tick on.
    pub fn add_instance(&mut self, instance: D::Instance) -> InstanceId {
        let id = InstanceId::next();
        self.instances.insert(id, instance);
        debug!(instance = %id, "instance added");
        id
    }

    /// Unregister an instance and drop all of its partitions and
    /// entities.
    pub fn remove_instance(&mut self, id: InstanceId) -> Option<D::Instance> {
        let instance = self.instances.shift_remove(&id)?;
        let partitions = self.dispatcher.remove_instance(id);
        debug!(instance = %id, partitions, "instance removed");
        Some(instance)
    }

    /// A registered instance.
    pub fn instance(&self, id: InstanceId) -> Option<&D::Instance> {
        self.instances.get(&id)
    }

    /// A registered instance, mutably. Only reachable between ticks.
    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut D::Instance> {
        self.instances.get_mut(&id)
    }

    /// Registered instances, in registration order.
    pub fn instance_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.instances.keys().copied()
    }

    /// Register an inbox drained in the intake phase, in registration
    /// order.
    pub fn add_inbox(&mut self, inbox: Inbox) {
        self.inboxes.push(inbox);
    }

    /// Register a flush target released in the flush phase.
    pub fn add_flush(&mut self, target: impl Flush) {
        self.flush_targets.push(Box::new(target));
    }

    /// Register a tick observer.
    pub fn add_observer(&mut self, observer: impl TickObserver) {
        self.observers.push(Box::new(observer));
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The scheduler, mutably.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &ThreadDispatcher<D> {
        &self.dispatcher
    }

    /// The dispatcher, mutably (membership changes).
    pub fn dispatcher_mut(&mut self) -> &mut ThreadDispatcher<D> {
        &mut self.dispatcher
    }

    /// The error sink every phase reports to.
    pub fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }

    /// The last completed tick (`TickId(0)` before the first).
    pub fn current_tick(&self) -> TickId {
        self.current_tick
    }

    /// Metrics of the last completed tick.
    pub fn last_metrics(&self) -> &TickMetrics {
        &self.last_metrics
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Run one complete tick started at `nano_time`.
    ///
    /// `nano_time` is stamped into the tick's [`TickStart`] and is what
    /// domain callbacks see. Phase and total durations are measured with
    /// the ticker's own clock from the moment `tick` is entered, so a
    /// caller's late or synthetic `nano_time` never skews the monitor.
    pub fn tick(&mut self, nano_time: u64) -> TickMonitor {
        let tick = self.current_tick.next();
        let start = TickStart::new(tick, nano_time);
        let span = trace_span!("tick", tick = tick.0);
        let _entered = span.enter();

        let sink = Arc::clone(&self.sink);
        let sink = sink.as_ref();
        let mut metrics = TickMetrics {
            tick,
            ..TickMetrics::default()
        };
        let t0 = self.clock.nanos();

        // 1. Tick-start scheduled tasks.
        metrics.scheduled_tasks = self.scheduler.process(SchedulePhase::TickStart, start, sink);
        let t1 = self.clock.nanos();
        metrics.scheduler_us = elapsed_us(t0, t1);

        // 2. Intake.
        for inbox in &mut self.inboxes {
            metrics.intake_items += inbox.drain(start, sink);
        }
        let t2 = self.clock.nanos();
        metrics.intake_us = elapsed_us(t1, t2);

        // 3. World instances, in registration order.
        for (id, instance) in &mut self.instances {
            let id = *id;
            if !run_isolated(sink, || UnitKind::Instance(id), || instance.tick(start)) {
                metrics.instance_failures += 1;
            }
        }
        metrics.instances = self.instances.len();
        let t3 = self.clock.nanos();
        metrics.world_us = elapsed_us(t2, t3);

        // 4. Dispatcher barrier, then refresh with the tick so far.
        metrics.dispatch = self.dispatcher.update_and_await(start);
        let t4 = self.clock.nanos();
        metrics.dispatch_us = elapsed_us(t3, t4);
        metrics.refresh = self
            .dispatcher
            .refresh_threads(Duration::from_nanos(t4.saturating_sub(t0)));
        let t5 = self.clock.nanos();
        metrics.refresh_us = elapsed_us(t4, t5);

        // 5. Tick-end scheduled tasks.
        metrics.scheduled_tasks += self.scheduler.process(SchedulePhase::TickEnd, start, sink);
        let t6 = self.clock.nanos();
        metrics.tick_end_us = elapsed_us(t5, t6);

        // 6. Flush.
        for target in &mut self.flush_targets {
            let mut delivered = 0;
            match catch(|| target.flush(start).map(|n| delivered = n)) {
                Ok(()) => metrics.flushed += delivered,
                Err(source) => {
                    let unit = UnitKind::Flush(target.name().to_string());
                    sink.handle(&EngineError::unit(unit, source));
                }
            }
        }
        let t7 = self.clock.nanos();
        metrics.flush_us = elapsed_us(t6, t7);

        // 7. Monitoring.
        metrics.total_us = elapsed_us(t0, t7);
        metrics.acquisition_ns = self.dispatcher.take_acquisition_nanos();
        let monitor = TickMonitor::from_metrics(&metrics);
        for observer in &mut self.observers {
            run_isolated(sink, || UnitKind::Observer, || observer.on_tick(&monitor));
        }

        self.current_tick = tick;
        self.last_metrics = metrics;
        monitor
    }

    /// Build a snapshot of every live instance and entity.
    pub fn update_snapshot<U>(&self, updater: &mut U) -> ServerSnapshot<U::InstanceSnapshot, U::EntitySnapshot>
    where
        U: SnapshotUpdater<D>,
    {
        SnapshotCoordinator::update_snapshot(self.current_tick, &self.instances, &self.dispatcher, updater)
    }

    /// Drop scheduled tasks and join the worker pool. Returns
    /// `(tasks_dropped, workers_joined)`.
    pub fn shutdown(&mut self) -> (usize, usize) {
        let dropped = self.scheduler.shutdown();
        let joined = self.dispatcher.shutdown();
        (dropped, joined)
    }
}

impl<D: Domain> fmt::Debug for Ticker<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker")
            .field("current_tick", &self.current_tick)
            .field("instances", &self.instances.len())
            .field("inboxes", &self.inboxes.len())
            .field("flush_targets", &self.flush_targets.len())
            .field("observers", &self.observers.len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
