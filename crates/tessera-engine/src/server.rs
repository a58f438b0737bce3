//! User-facing [`Server`] API and its shutdown sequence.
//!
//! # Architecture
//!
//! ```text
//! Caller thread(s)             Tick thread (driven mode)     Workers (N)
//!     |                             |                             |
//!     |--execute(job)-------------->| jobs.try_recv()             |
//!     |   [jobs: bounded(cap)]      | job(&mut ticker)            |
//!     |<--result via reply----------| ticker.tick()               |
//!     |                             |   update_and_await -------->| drain deferred
//!     |                             |   <------- barrier reports -| update partitions
//!     |                             |   refresh_threads           |
//!     |                             | park_timeout(budget - dt)   |
//! ```
//!
//! Without `tick_rate_hz` there is no tick thread: the ticker stays
//! behind a mutex and the embedder calls [`Server::tick`] itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{SendError, Sender};
use thiserror::Error;
use tessera_core::{Domain, EngineError, ErrorSink, TickId, UnitKind};
use tracing::{error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::driver::{spawn_driver, Job, TickDriver};
use crate::isolate::catch;
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState};
use crate::metrics::TickMonitor;
use crate::snapshot::{ServerSnapshot, SnapshotUpdater};
use crate::ticker::Ticker;

// ── Error types ────────────────────────────────────────────────────

/// Error from a [`Server`] operation.
#[derive(Debug, PartialEq, Error)]
pub enum ServerError {
    /// Lifecycle misuse, e.g. a second `start`.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The configuration was rejected or a thread could not be spawned.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The operation needs a different lifecycle state.
    #[error("server is {state}")]
    NotRunning {
        /// The state observed.
        state: LifecycleState,
    },
    /// [`Server::tick`] was called while the tick thread drives ticks.
    #[error("ticks are driven by the tick thread")]
    DriverOwnsTicks,
    /// A job never completed: it panicked, or the tick thread stopped
    /// first.
    #[error("orchestrator job did not complete")]
    JobAborted,
}

// ── ShutdownReport ─────────────────────────────────────────────────

/// Report from the shutdown sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Total time spent in the shutdown sequence.
    pub total_ms: u64,
    /// Whether the tick thread was joined (`true` if there was none).
    pub driver_joined: bool,
    /// Number of dispatcher worker threads joined.
    pub workers_joined: usize,
    /// Scheduled tasks dropped.
    pub tasks_dropped: usize,
    /// Shutdown hooks run.
    pub hooks_run: usize,
    /// The last tick completed before shutdown.
    pub final_tick: TickId,
}

// ── Server ─────────────────────────────────────────────────────────

type ShutdownHook = Box<dyn FnOnce() + Send>;

enum Mode<D: Domain> {
    Manual(Ticker<D>),
    Driven {
        jobs: Sender<Job<D>>,
        shutdown: Arc<AtomicBool>,
        thread: JoinHandle<Option<Ticker<D>>>,
    },
    Gone,
}

/// A tick engine with a lifecycle.
///
/// Every method takes `&self`; `Server` is `Send + Sync` and may be
/// shared across threads behind an `Arc`.
pub struct Server<D: Domain> {
    lifecycle: Lifecycle,
    mode: Mutex<Mode<D>>,
    hooks: Mutex<Vec<ShutdownHook>>,
    sink: Arc<dyn ErrorSink>,
    config: EngineConfig,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: Domain> Server<D> {
    /// Create a server and its worker pool. Nothing ticks until
    /// [`start`](Self::start).
    pub fn new(config: EngineConfig, sink: Arc<dyn ErrorSink>) -> Result<Self, ServerError> {
        let ticker = Ticker::new(&config, Arc::clone(&sink))?;
        Ok(Self {
            lifecycle: Lifecycle::new(),
            mode: Mutex::new(Mode::Manual(ticker)),
            hooks: Mutex::new(Vec::new()),
            sink,
            config,
        })
    }

    /// `NotStarted → Running`.
    ///
    /// With `tick_rate_hz` configured, the ticker moves onto a dedicated
    /// tick thread. A second call fails with
    /// [`LifecycleError::IllegalState`] and changes nothing. A tick thread
    /// that cannot be spawned fails the call and leaves the server not
    /// started, ticker intact.
    pub fn start(&self) -> Result<(), ServerError> {
        let budget = self.config.tick_budget()?;
        // Held across the transition so `stop` and `execute` never see a
        // half-started server.
        let mut mode = lock(&self.mode);
        let Some(budget) = budget else {
            self.lifecycle.start()?;
            info!("server started (manual ticking)");
            return Ok(());
        };

        // Spawned before the state changes: a refused spawn leaves nothing
        // to undo.
        let name = format!("{}-tick", self.config.thread_name_prefix);
        let (hand_off, thread) = spawn_driver(name).map_err(|e| {
            error!(error = %e, "tick thread could not be spawned");
            ConfigError::ThreadSpawnFailed {
                reason: format!("tick thread: {e}"),
            }
        })?;
        // On failure the idle thread sees `hand_off` dropped and exits.
        self.lifecycle.start()?;

        let Mode::Manual(ticker) = std::mem::replace(&mut *mode, Mode::Gone) else {
            return Ok(());
        };
        let (jobs, jobs_rx) = crossbeam_channel::bounded(self.config.job_queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let driver = TickDriver::new(ticker, jobs_rx, Arc::clone(&shutdown), budget);
        if let Err(SendError(driver)) = hand_off.send(driver) {
            *mode = Mode::Manual(driver.into_ticker());
            self.lifecycle.revert_start();
            error!("tick thread exited before taking the ticker");
            return Err(ConfigError::ThreadSpawnFailed {
                reason: "tick thread exited before taking the ticker".to_string(),
            }
            .into());
        }
        *mode = Mode::Driven {
            jobs,
            shutdown,
            thread,
        };
        info!(budget_ms = budget.as_secs_f64() * 1_000.0, "server started");
        Ok(())
    }

    /// The lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Running, and the tick thread (if any) has not died.
    pub fn is_alive(&self) -> bool {
        if !self.lifecycle.is_running() {
            return false;
        }
        match &*lock(&self.mode) {
            Mode::Manual(_) => true,
            Mode::Driven { thread, .. } => !thread.is_finished(),
            Mode::Gone => false,
        }
    }

    /// Run one tick on the calling thread (manual mode only).
    pub fn tick(&self, nano_time: u64) -> Result<TickMonitor, ServerError> {
        let state = self.lifecycle.state();
        if state != LifecycleState::Running {
            return Err(ServerError::NotRunning { state });
        }
        match &mut *lock(&self.mode) {
            Mode::Manual(ticker) => Ok(ticker.tick(nano_time)),
            Mode::Driven { .. } => Err(ServerError::DriverOwnsTicks),
            Mode::Gone => Err(ServerError::NotRunning {
                state: LifecycleState::Stopped,
            }),
        }
    }

    /// Run `job` on the orchestrator between ticks and return its result.
    ///
    /// Blocks until the job has run: at most one tick period in driven
    /// mode. Usable before `start` to register instances and partitions.
    pub fn execute<R, F>(&self, job: F) -> Result<R, ServerError>
    where
        F: FnOnce(&mut Ticker<D>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (jobs, waker) = {
            let mut mode = lock(&self.mode);
            match &mut *mode {
                Mode::Manual(ticker) => return Ok(job(ticker)),
                Mode::Driven { jobs, thread, .. } => (jobs.clone(), thread.thread().clone()),
                Mode::Gone => {
                    return Err(ServerError::NotRunning {
                        state: self.lifecycle.state(),
                    })
                }
            }
        };

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let boxed: Job<D> = Box::new(move |ticker: &mut Ticker<D>| {
            let _ = reply_tx.send(job(ticker));
        });
        jobs.send(boxed).map_err(|_| ServerError::JobAborted)?;
        waker.unpark();
        reply_rx.recv().map_err(|_| ServerError::JobAborted)
    }

    /// Build a snapshot of every live instance and entity.
    pub fn update_snapshot<U>(&self, updater: U) -> Result<ServerSnapshot<U::InstanceSnapshot, U::EntitySnapshot>, ServerError>
    where
        U: SnapshotUpdater<D> + Send + 'static,
    {
        self.execute(move |ticker| {
            let mut updater = updater;
            ticker.update_snapshot(&mut updater)
        })
    }

    /// Register a hook run once, in registration order, at the end of
    /// the shutdown sequence.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        lock(&self.hooks).push(Box::new(hook));
    }

    /// Stop the server.
    ///
    /// The first call (from `Running` or `NotStarted`) runs the shutdown
    /// sequence: stop the tick thread, drop scheduled tasks, join the
    /// worker pool, then run the shutdown hooks. Every later call returns
    /// `None` without doing anything.
    pub fn stop(&self) -> Option<ShutdownReport> {
        if !self.lifecycle.stop() {
            return None;
        }
        let start = Instant::now();
        let mode = std::mem::replace(&mut *lock(&self.mode), Mode::Gone);

        // 1. Stop the tick thread and recover the ticker.
        let (ticker, driver_joined) = match mode {
            Mode::Manual(ticker) => (Some(ticker), true),
            Mode::Driven {
                jobs,
                shutdown,
                thread,
            } => {
                shutdown.store(true, Ordering::Release);
                drop(jobs);
                thread.thread().unpark();
                match thread.join() {
                    Ok(ticker) => (ticker, true),
                    Err(_) => {
                        warn!("tick thread panicked, ticker state lost");
                        (None, false)
                    }
                }
            }
            Mode::Gone => (None, true),
        };

        // 2. Scheduler and worker pool.
        let (tasks_dropped, workers_joined, final_tick) = match ticker {
            Some(mut ticker) => {
                let (dropped, joined) = ticker.shutdown();
                (dropped, joined, ticker.current_tick())
            }
            None => (0, 0, TickId(0)),
        };

        // 3. Hooks, in registration order, each isolated.
        let hooks = std::mem::take(&mut *lock(&self.hooks));
        let hooks_run = hooks.len();
        for hook in hooks {
            if let Err(source) = catch(|| {
                hook();
                Ok(())
            }) {
                self.sink.handle(&EngineError::unit(UnitKind::Job, source));
            }
        }

        let report = ShutdownReport {
            total_ms: start.elapsed().as_millis() as u64,
            driver_joined,
            workers_joined,
            tasks_dropped,
            hooks_run,
            final_tick,
        };
        info!(?report, "server stopped");
        Some(report)
    }
}

impl<D: Domain> Drop for Server<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<D: Domain> fmt::Debug for Server<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &*lock(&self.mode) {
            Mode::Manual(_) => "manual",
            Mode::Driven { .. } => "driven",
            Mode::Gone => "gone",
        };
        f.debug_struct("Server")
            .field("state", &self.lifecycle.state())
            .field("mode", &mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tessera_core::{ChunkPos, PartitionKey};
    use tessera_test_utils::{CollectingSink, CountingUnit, TestDomain, TestInstance};

    fn server(tick_rate_hz: Option<f64>) -> (Server<TestDomain>, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let config = EngineConfig {
            worker_count: Some(2),
            tick_rate_hz,
            ..EngineConfig::default()
        };
        (Server::new(config, sink.clone()).unwrap(), sink)
    }

    #[test]
    fn server_is_send_and_sync() {
        fn assert<T: Send + Sync>() {}
        assert::<Server<TestDomain>>();
    }

    #[test]
    fn double_start_is_illegal_state() {
        let (server, _sink) = server(None);
        server.start().unwrap();
        assert_eq!(
            server.start(),
            Err(ServerError::Lifecycle(LifecycleError::IllegalState {
                expected: LifecycleState::NotStarted,
                actual: LifecycleState::Running,
            }))
        );
        assert_eq!(server.state(), LifecycleState::Running);
        assert!(server.is_alive());
    }

    #[test]
    fn manual_ticks_need_running_state() {
        let (server, _sink) = server(None);
        assert_eq!(
            server.tick(0),
            Err(ServerError::NotRunning {
                state: LifecycleState::NotStarted
            })
        );
        server.start().unwrap();
        assert_eq!(server.tick(0).map(|m| m.tick), Ok(TickId(1)));
        server.stop();
        assert_eq!(
            server.tick(0),
            Err(ServerError::NotRunning {
                state: LifecycleState::Stopped
            })
        );
    }

    #[test]
    fn stop_runs_shutdown_once() {
        let (server, _sink) = server(None);
        let hooks = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hooks);
        server.on_shutdown(move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        server.start().unwrap();
        server.tick(0).unwrap();

        let report = server.stop().unwrap();
        assert!(report.driver_joined);
        assert_eq!(report.workers_joined, 2);
        assert_eq!(report.hooks_run, 1);
        assert_eq!(report.final_tick, TickId(1));
        assert!(server.stop().is_none());
        assert_eq!(hooks.load(Ordering::Relaxed), 1);
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(!server.is_alive());
    }

    #[test]
    fn stop_before_start_shuts_down_and_forbids_start() {
        let (server, _sink) = server(None);
        let report = server.stop().unwrap();
        assert_eq!(report.workers_joined, 2);
        assert_eq!(report.final_tick, TickId(0));
        assert!(matches!(server.start(), Err(ServerError::Lifecycle(_))));
    }

    #[test]
    fn execute_runs_on_the_tick_thread() {
        let (server, sink) = server(Some(250.0));
        let world = server
            .execute(|t: &mut Ticker<TestDomain>| {
                let world = t.add_instance(TestInstance::new());
                t.dispatcher_mut()
                    .create_partition(PartitionKey::new(world, ChunkPos::new(0, 0)), CountingUnit::new())
                    .map(|_| world)
            })
            .unwrap()
            .unwrap();
        server.start().unwrap();
        assert!(server.is_alive());
        assert_eq!(server.tick(0), Err(ServerError::DriverOwnsTicks));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let ticks = server
                .execute(move |t: &mut Ticker<TestDomain>| t.instance(world).map(|i| i.ticks))
                .unwrap();
            if ticks >= Some(3) {
                break;
            }
            assert!(Instant::now() < deadline, "tick thread made no progress");
            std::thread::sleep(Duration::from_millis(5));
        }

        let name = server
            .execute(|_: &mut Ticker<TestDomain>| std::thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(name.as_deref(), Some("tessera-tick"));

        let report = server.stop().unwrap();
        assert!(report.driver_joined);
        assert!(report.final_tick >= TickId(3));
        assert!(sink.is_empty());
        assert_eq!(
            server.execute(|_: &mut Ticker<TestDomain>| ()),
            Err(ServerError::NotRunning {
                state: LifecycleState::Stopped
            })
        );
    }

    #[test]
    fn refused_tick_thread_leaves_server_startable() {
        let (server, sink) = server(Some(250.0));
        let world = server
            .execute(|t: &mut Ticker<TestDomain>| t.add_instance(TestInstance::new()))
            .unwrap();

        crate::driver::fail_next_spawn();
        assert!(matches!(
            server.start(),
            Err(ServerError::Config(ConfigError::ThreadSpawnFailed { .. }))
        ));
        assert_eq!(server.state(), LifecycleState::NotStarted);
        assert!(!server.is_alive());
        // Still manual: the ticker survived and jobs run inline.
        assert_eq!(
            server.execute(move |t: &mut Ticker<TestDomain>| t.instance(world).is_some()),
            Ok(true)
        );

        server.start().unwrap();
        assert!(server.is_alive());
        assert_eq!(server.tick(0), Err(ServerError::DriverOwnsTicks));
        let report = server.stop().unwrap();
        assert!(report.driver_joined);
        assert_eq!(report.workers_joined, 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn unrepresentable_tick_rate_is_refused_up_front() {
        let config = EngineConfig {
            worker_count: Some(1),
            tick_rate_hz: Some(1e-30),
            ..EngineConfig::default()
        };
        assert_eq!(
            Server::<TestDomain>::new(config, Arc::new(CollectingSink::new())).err(),
            Some(ServerError::Config(ConfigError::InvalidTickRate { value: 1e-30 }))
        );
    }

    #[test]
    fn panicking_hook_is_reported_and_later_hooks_run() {
        let (server, sink) = server(None);
        let ran = Arc::new(AtomicUsize::new(0));
        server.on_shutdown(|| panic!("hook bug"));
        let r = Arc::clone(&ran);
        server.on_shutdown(move || {
            r.fetch_add(1, Ordering::Relaxed);
        });
        let report = server.stop().unwrap();
        assert_eq!(report.hooks_run, 2);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(sink.unit_failures(), vec![UnitKind::Job]);
    }
}
