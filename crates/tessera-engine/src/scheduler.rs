//! Tick-phase task scheduler.
//!
//! Tasks run on the orchestrator during the tick-start phase (before
//! intake and world update) or the tick-end phase (after the dispatcher
//! barrier). The [`Scheduler`] lives inside the ticker; other threads
//! submit through a [`SchedulerHandle`], whose submissions are picked up
//! at the next phase boundary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use tessera_core::{ErrorSink, TickStart, UnitKind, UpdateError};
use tracing::debug;

use crate::isolate::run_isolated;

/// A scheduled task body. Repeating tasks are called once per run.
pub type Task = Box<dyn FnMut(TickStart) -> Result<(), UpdateError> + Send>;

/// Identifies a scheduled task, for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Which orchestrator phase a task runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulePhase {
    /// Phase 1, before intake and world update.
    TickStart,
    /// Phase 5, after the dispatcher barrier and refresh.
    TickEnd,
}

/// When a task runs, relative to the tick it was scheduled in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Once, on the next tick.
    NextTick,
    /// Once, `n` ticks from now (`0` behaves like `1`).
    Delay(u64),
    /// On the next tick, then every `n` ticks (`0` behaves like `1`).
    Every(u64),
}

struct Scheduled {
    phase: SchedulePhase,
    due: u64,
    period: Option<u64>,
    task: Task,
}

enum Submission {
    Add {
        id: TaskId,
        phase: SchedulePhase,
        schedule: Schedule,
        task: Task,
    },
    Cancel(TaskId),
}

/// Orchestrator-owned task table.
pub struct Scheduler {
    next_id: Arc<AtomicU64>,
    tasks: IndexMap<TaskId, Scheduled>,
    /// The tick most recently started; schedules are relative to it.
    current: u64,
    submit_tx: Sender<Submission>,
    submit_rx: Receiver<Submission>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.len())
            .field("current", &self.current)
            .finish()
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        let (submit_tx, submit_rx) = crossbeam_channel::unbounded();
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            tasks: IndexMap::new(),
            current: 0,
            submit_tx,
            submit_rx,
        }
    }

    /// Register a task.
    pub fn schedule<F>(&mut self, phase: SchedulePhase, schedule: Schedule, task: F) -> TaskId
    where
        F: FnMut(TickStart) -> Result<(), UpdateError> + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.insert(id, phase, schedule, Box::new(task));
        id
    }

    fn insert(&mut self, id: TaskId, phase: SchedulePhase, schedule: Schedule, task: Task) {
        let (due, period) = match schedule {
            Schedule::NextTick => (self.current + 1, None),
            Schedule::Delay(n) => (self.current + n.max(1), None),
            Schedule::Every(n) => (self.current + 1, Some(n.max(1))),
        };
        self.tasks.insert(
            id,
            Scheduled {
                phase,
                due,
                period,
                task,
            },
        );
    }

    /// Remove a task. Returns `false` if it already ran or never existed.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.tasks.shift_remove(&id).is_some()
    }

    /// A thread-safe handle for scheduling from outside the orchestrator.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            next_id: Arc::clone(&self.next_id),
            tx: self.submit_tx.clone(),
        }
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn absorb_submissions(&mut self) {
        while let Ok(submission) = self.submit_rx.try_recv() {
            match submission {
                Submission::Add {
                    id,
                    phase,
                    schedule,
                    task,
                } => self.insert(id, phase, schedule, task),
                Submission::Cancel(id) => {
                    self.cancel(id);
                }
            }
        }
    }

    /// Run every task of `phase` due at `tick`, each isolated.
    ///
    /// Returns how many tasks ran. One-shot tasks are removed after
    /// running, whether or not they failed.
    pub fn process(&mut self, phase: SchedulePhase, tick: TickStart, sink: &dyn ErrorSink) -> usize {
        // Submissions made between ticks are relative to the previous one.
        self.absorb_submissions();
        if phase == SchedulePhase::TickStart {
            self.current = tick.tick.0;
        }

        let now = tick.tick.0;
        let mut ran = 0;
        let mut finished: Vec<TaskId> = Vec::new();
        for (id, scheduled) in self.tasks.iter_mut() {
            if scheduled.phase != phase || scheduled.due > now {
                continue;
            }
            let task_id = id.0;
            run_isolated(sink, || UnitKind::ScheduledTask(task_id), || (scheduled.task)(tick));
            ran += 1;
            match scheduled.period {
                Some(period) => scheduled.due = now + period,
                None => finished.push(*id),
            }
        }
        for id in finished {
            self.tasks.shift_remove(&id);
        }
        ran
    }

    /// Drop every task, including pending submissions. Returns how many
    /// were dropped.
    pub fn shutdown(&mut self) -> usize {
        self.absorb_submissions();
        let dropped = self.tasks.len();
        self.tasks.clear();
        debug!(dropped, "scheduler shut down");
        dropped
    }
}

/// Schedules and cancels tasks from any thread.
///
/// Submissions take effect at the scheduler's next phase boundary.
#[derive(Clone)]
pub struct SchedulerHandle {
    next_id: Arc<AtomicU64>,
    tx: Sender<Submission>,
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl SchedulerHandle {
    /// Queue a task. Returns `None` if the scheduler is gone.
    pub fn schedule<F>(&self, phase: SchedulePhase, schedule: Schedule, task: F) -> Option<TaskId>
    where
        F: FnMut(TickStart) -> Result<(), UpdateError> + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(Submission::Add {
                id,
                phase,
                schedule,
                task: Box::new(task),
            })
            .ok()?;
        Some(id)
    }

    /// Queue a cancellation. Returns `false` if the scheduler is gone.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.tx.send(Submission::Cancel(id)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tessera_core::TickId;
    use tessera_test_utils::CollectingSink;

    fn at(n: u64) -> TickStart {
        TickStart::new(TickId(n), 0)
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(TickStart) -> Result<(), UpdateError> + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn run_ticks(s: &mut Scheduler, sink: &CollectingSink, ticks: std::ops::RangeInclusive<u64>) {
        for n in ticks {
            s.process(SchedulePhase::TickStart, at(n), sink);
            s.process(SchedulePhase::TickEnd, at(n), sink);
        }
    }

    #[test]
    fn one_shot_runs_once_next_tick() {
        let sink = CollectingSink::new();
        let mut s = Scheduler::new();
        let (hits, task) = counter();
        s.schedule(SchedulePhase::TickStart, Schedule::NextTick, task);
        run_ticks(&mut s, &sink, 1..=3);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn delay_waits_n_ticks() {
        let sink = CollectingSink::new();
        let mut s = Scheduler::new();
        run_ticks(&mut s, &sink, 1..=2);
        let (hits, task) = counter();
        s.schedule(SchedulePhase::TickEnd, Schedule::Delay(3), task);
        run_ticks(&mut s, &sink, 3..=4);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        run_ticks(&mut s, &sink, 5..=5);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn every_repeats_until_cancelled() {
        let sink = CollectingSink::new();
        let mut s = Scheduler::new();
        let (hits, task) = counter();
        let id = s.schedule(SchedulePhase::TickStart, Schedule::Every(2), task);
        run_ticks(&mut s, &sink, 1..=6);
        // Ticks 1, 3, 5.
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert!(s.cancel(id));
        run_ticks(&mut s, &sink, 7..=10);
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert!(!s.cancel(id));
    }

    #[test]
    fn phases_are_separate() {
        let sink = CollectingSink::new();
        let mut s = Scheduler::new();
        let (hits, task) = counter();
        s.schedule(SchedulePhase::TickEnd, Schedule::NextTick, task);
        assert_eq!(s.process(SchedulePhase::TickStart, at(1), &sink), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(s.process(SchedulePhase::TickEnd, at(1), &sink), 1);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failing_task_is_isolated_and_keeps_repeating() {
        let sink = CollectingSink::new();
        let mut s = Scheduler::new();
        let id = s.schedule(SchedulePhase::TickStart, Schedule::Every(1), |_| {
            Err(UpdateError::failed("nope"))
        });
        let (hits, task) = counter();
        s.schedule(SchedulePhase::TickStart, Schedule::Every(1), task);
        run_ticks(&mut s, &sink, 1..=2);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        assert_eq!(
            sink.unit_failures(),
            vec![UnitKind::ScheduledTask(id.0), UnitKind::ScheduledTask(id.0)]
        );
    }

    #[test]
    fn handle_submissions_apply_at_next_phase() {
        let sink = CollectingSink::new();
        let mut s = Scheduler::new();
        let handle = s.handle();
        let (hits, task) = counter();
        let id = std::thread::spawn(move || {
            handle
                .schedule(SchedulePhase::TickStart, Schedule::Every(1), task)
                .unwrap()
        })
        .join()
        .unwrap();
        run_ticks(&mut s, &sink, 1..=2);
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        assert!(s.handle().cancel(id));
        run_ticks(&mut s, &sink, 3..=4);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn shutdown_drops_everything() {
        let mut s = Scheduler::new();
        s.schedule(SchedulePhase::TickStart, Schedule::Every(1), |_| Ok(()));
        s.handle()
            .schedule(SchedulePhase::TickEnd, Schedule::NextTick, |_| Ok(()));
        assert_eq!(s.shutdown(), 2);
        assert!(s.is_empty());
    }
}
