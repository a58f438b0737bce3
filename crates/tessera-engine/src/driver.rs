//! Fixed-rate tick driver.
//!
//! The driver thread owns the [`Ticker`] exclusively (moved in at spawn).
//! Other threads reach it only through the bounded job channel; jobs run
//! between ticks, never inside one. Between ticks the thread sleeps with
//! `park_timeout`, so shutdown and newly queued jobs wake it immediately.
//!
//! The thread is spawned idle and handed its driver afterwards, so a
//! caller whose spawn fails still owns the ticker.

use std::io;
#[cfg(test)]
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tessera_core::{Domain, EngineError, UnitKind};
use tracing::{info, warn};

use crate::clock::monotonic_nanos;
use crate::isolate::catch;
use crate::ticker::Ticker;

/// A closure run on the orchestrator between ticks.
pub(crate) type Job<D> = Box<dyn FnOnce(&mut Ticker<D>) + Send>;

/// State held by the driver thread's main loop.
pub(crate) struct TickDriver<D: Domain> {
    ticker: Ticker<D>,
    jobs: Receiver<Job<D>>,
    shutdown: Arc<AtomicBool>,
    tick_budget: Duration,
}

impl<D: Domain> TickDriver<D> {
    /// `tick_budget` is the period of one tick; see
    /// [`EngineConfig::tick_budget`](crate::EngineConfig::tick_budget).
    pub(crate) fn new(ticker: Ticker<D>, jobs: Receiver<Job<D>>, shutdown: Arc<AtomicBool>, tick_budget: Duration) -> Self {
        Self {
            ticker,
            jobs,
            shutdown,
            tick_budget,
        }
    }

    /// Give the ticker back without running.
    pub(crate) fn into_ticker(self) -> Ticker<D> {
        self.ticker
    }

    /// Main loop. Runs until the shutdown flag is set, then returns the
    /// ticker so the caller can shut it down.
    pub(crate) fn run(mut self) -> Ticker<D> {
        info!(budget_ms = self.tick_budget.as_secs_f64() * 1_000.0, "tick driver started");
        while !self.shutdown.load(Ordering::Acquire) {
            let tick_start = Instant::now();

            // 1. Jobs queued since the last tick.
            self.drain_jobs();

            // 2. The tick.
            let monitor = self.ticker.tick(monotonic_nanos());

            // 3. Sleep for the remaining budget.
            let elapsed = tick_start.elapsed();
            if elapsed > self.tick_budget {
                warn!(
                    tick = %monitor.tick,
                    elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
                    budget_ms = self.tick_budget.as_secs_f64() * 1_000.0,
                    "tick overran its budget"
                );
            } else {
                self.idle_until(tick_start + self.tick_budget);
            }
        }

        // Jobs still queued get to run so their callers are answered.
        self.drain_jobs();
        info!(tick = %self.ticker.current_tick(), "tick driver stopped");
        self.ticker
    }

    fn idle_until(&mut self, deadline: Instant) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            thread::park_timeout(remaining);
            self.drain_jobs();
        }
    }

    fn drain_jobs(&mut self) {
        while let Ok(job) = self.jobs.try_recv() {
            let ticker = &mut self.ticker;
            if let Err(source) = catch(|| {
                job(ticker);
                Ok(())
            }) {
                let sink = Arc::clone(self.ticker.sink());
                sink.handle(&EngineError::unit(UnitKind::Job, source));
            }
        }
    }
}

#[cfg(test)]
thread_local! {
    static FAIL_NEXT_SPAWN: Cell<bool> = const { Cell::new(false) };
}

/// Make the next [`spawn_driver`] on this thread fail.
#[cfg(test)]
pub(crate) fn fail_next_spawn() {
    FAIL_NEXT_SPAWN.with(|f| f.set(true));
}

/// Spawn an idle driver thread.
///
/// The thread waits for a [`TickDriver`] on the returned sender, runs it,
/// and returns its ticker on exit. If the sender is dropped unused the
/// thread exits with `None`.
pub(crate) fn spawn_driver<D: Domain>(
    name: String,
) -> io::Result<(Sender<TickDriver<D>>, JoinHandle<Option<Ticker<D>>>)> {
    #[cfg(test)]
    if FAIL_NEXT_SPAWN.with(|f| f.replace(false)) {
        return Err(io::Error::other("spawn refused for test"));
    }
    let (hand_off, receive) = crossbeam_channel::bounded::<TickDriver<D>>(1);
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || receive.recv().ok().map(TickDriver::run))?;
    Ok((hand_off, thread))
}
