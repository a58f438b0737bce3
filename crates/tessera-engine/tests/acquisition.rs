//! Cross-partition access through acquirables, driven by real workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_core::{
    ChunkPos, Domain, EntityId, InstanceId, PartitionKey, TickId, TickStart, Tickable, UpdateError,
};
use tessera_engine::{Access, Acquirable, EngineConfig, ThreadDispatcher, Ticker};
use tessera_test_utils::{CollectingSink, TestInstance};

/// A chunk or entity that, on its first update, pokes `target` a number
/// of times through `with_safe` (or `sync`, when `blocking`) and records
/// how each poke was handled.
#[derive(Default)]
struct Courier {
    target: Option<Acquirable<Courier>>,
    pokes: usize,
    accesses: Arc<Mutex<Vec<Access>>>,
    touches: u64,
    touches_at_update: Vec<u64>,
    /// Raised when this courier's update begins.
    updating: Option<Arc<AtomicBool>>,
    /// Poke only once this flag is raised.
    wait_for: Option<Arc<AtomicBool>>,
    blocking: bool,
    /// Keep the update (and so the value's lock) going this long.
    linger: Duration,
}

impl Courier {
    fn poking(target: Acquirable<Courier>, pokes: usize, accesses: Arc<Mutex<Vec<Access>>>) -> Self {
        Self {
            target: Some(target),
            pokes,
            accesses,
            ..Self::default()
        }
    }
}

impl Tickable for Courier {
    fn update(&mut self, _tick: TickStart) -> Result<(), UpdateError> {
        self.touches_at_update.push(self.touches);
        if let Some(flag) = &self.updating {
            flag.store(true, Ordering::Release);
        }
        if let Some(flag) = &self.wait_for {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !flag.load(Ordering::Acquire) && Instant::now() < deadline {
                std::thread::yield_now();
            }
        }
        if let Some(target) = self.target.take() {
            for _ in 0..self.pokes {
                if self.blocking {
                    target.sync(|t| t.touches += 1);
                } else {
                    let access = target.with_safe(|t| t.touches += 1);
                    self.accesses.lock().unwrap().push(access);
                }
            }
        }
        if !self.linger.is_zero() {
            std::thread::sleep(self.linger);
        }
        Ok(())
    }
}

struct CourierDomain;

impl Domain for CourierDomain {
    type Instance = TestInstance;
    type Chunk = Courier;
    type Entity = Courier;
}

fn setup(workers: usize) -> (ThreadDispatcher<CourierDomain>, Arc<CollectingSink>, InstanceId) {
    let sink = Arc::new(CollectingSink::new());
    let config = EngineConfig {
        worker_count: Some(workers),
        ..EngineConfig::default()
    };
    let d = ThreadDispatcher::new(&config, sink.clone()).unwrap();
    (d, sink, InstanceId::next())
}

fn at(n: u64) -> TickStart {
    TickStart::new(TickId(n), 0)
}

// ── Scenario B ───────────────────────────────────────────────────

#[test]
fn actions_from_another_worker_run_at_the_owners_next_safe_point() {
    let (mut d, sink, world) = setup(2);
    let p_key = PartitionKey::new(world, ChunkPos::new(0, 0));
    let q_key = PartitionKey::new(world, ChunkPos::new(1, 0));

    // Q pokes only after P's update has begun, which is after P's safe
    // point for this tick.
    let p_updating = Arc::new(AtomicBool::new(false));
    let p = d
        .create_partition(
            p_key,
            Courier {
                updating: Some(Arc::clone(&p_updating)),
                ..Courier::default()
            },
        )
        .unwrap();
    let accesses = Arc::new(Mutex::new(Vec::new()));
    let q = d
        .create_partition(
            q_key,
            Courier {
                wait_for: Some(p_updating),
                ..Courier::poking(p.clone(), 3, Arc::clone(&accesses))
            },
        )
        .unwrap();

    d.update_and_await(at(1));
    assert_ne!(p.owner(), q.owner(), "round robin puts P and Q on different workers");
    assert_eq!(*accesses.lock().unwrap(), vec![Access::Deferred; 3]);
    assert_eq!(p.sync(|c| c.touches), 0, "nothing runs before P's next safe point");

    let stats = d.update_and_await(at(2));
    assert_eq!(stats.deferred_actions, 3);
    // Tick 1's update saw none of the actions; tick 2's saw all three.
    assert_eq!(p.sync(|c| c.touches_at_update.clone()), vec![0, 3]);

    d.update_and_await(at(3));
    assert_eq!(p.sync(|c| c.touches), 3, "each action ran exactly once");
    assert!(sink.is_empty());
}

#[test]
fn owner_fast_path_runs_immediately() {
    let (mut d, sink, world) = setup(2);
    let key = PartitionKey::new(world, ChunkPos::new(0, 0));
    let chunk = d.create_partition(key, Courier::default()).unwrap();
    let accesses = Arc::new(Mutex::new(Vec::new()));
    d.add_entity(EntityId(1), Courier::poking(chunk.clone(), 2, Arc::clone(&accesses)), key)
        .unwrap();

    let stats = d.update_and_await(at(1));

    assert_eq!(*accesses.lock().unwrap(), vec![Access::Immediate; 2]);
    assert_eq!(stats.deferred_actions, 0);
    assert_eq!(chunk.sync(|c| c.touches), 2);
    assert!(sink.is_empty());
}

// ── Re-entry ─────────────────────────────────────────────────────

#[test]
fn reaching_back_into_itself_defers_instead_of_blocking() {
    let (mut d, sink, world) = setup(2);
    let key = PartitionKey::new(world, ChunkPos::new(0, 0));
    let chunk_accesses = Arc::new(Mutex::new(Vec::new()));
    let entity_accesses = Arc::new(Mutex::new(Vec::new()));
    let chunk = d
        .create_partition(
            key,
            Courier {
                pokes: 1,
                accesses: Arc::clone(&chunk_accesses),
                ..Courier::default()
            },
        )
        .unwrap();
    let entity = d
        .add_entity(
            EntityId(1),
            Courier {
                pokes: 2,
                accesses: Arc::clone(&entity_accesses),
                ..Courier::default()
            },
            key,
        )
        .unwrap();
    // Each one's target is its own handle.
    let me = chunk.clone();
    chunk.sync(move |c| c.target = Some(me));
    let me = entity.clone();
    entity.sync(move |e| e.target = Some(me));

    // The ticks run off the test thread so a hung barrier fails the test
    // instead of hanging it.
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        d.update_and_await(at(1));
        let second = d.update_and_await(at(2));
        let _ = done_tx.send(second.deferred_actions);
    });
    let deferred = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("self access must not block the owning worker");

    assert_eq!(*chunk_accesses.lock().unwrap(), vec![Access::Deferred]);
    assert_eq!(*entity_accesses.lock().unwrap(), vec![Access::Deferred; 2]);
    assert_eq!(deferred, 3);
    assert_eq!(chunk.sync(|c| c.touches_at_update.clone()), vec![0, 1]);
    assert_eq!(entity.sync(|e| e.touches_at_update.clone()), vec![0, 2]);
    assert!(sink.is_empty());
}

// ── Accounting ───────────────────────────────────────────────────

#[test]
fn contended_access_is_reported_once_in_the_tick_monitor() {
    let sink = Arc::new(CollectingSink::new());
    let config = EngineConfig {
        worker_count: Some(2),
        ..EngineConfig::default()
    };
    let mut ticker: Ticker<CourierDomain> = Ticker::new(&config, sink.clone()).unwrap();
    let world = ticker.add_instance(TestInstance::default());
    let p_key = PartitionKey::new(world, ChunkPos::new(0, 0));
    let q_key = PartitionKey::new(world, ChunkPos::new(1, 0));

    // P holds its own value for 30ms; Q blocks on it with `sync` meanwhile.
    let p_updating = Arc::new(AtomicBool::new(false));
    let p = ticker
        .dispatcher_mut()
        .create_partition(
            p_key,
            Courier {
                updating: Some(Arc::clone(&p_updating)),
                linger: Duration::from_millis(30),
                ..Courier::default()
            },
        )
        .unwrap();
    let q = ticker
        .dispatcher_mut()
        .create_partition(
            q_key,
            Courier {
                wait_for: Some(p_updating),
                blocking: true,
                ..Courier::poking(p.clone(), 1, Arc::default())
            },
        )
        .unwrap();
    assert_ne!(p.owner(), q.owner());

    let first = ticker.tick(0);
    assert!(
        first.acquisition_time_ms >= 5.0,
        "blocked wait should be charged, got {}ms",
        first.acquisition_time_ms
    );
    assert_eq!(p.sync(|c| c.touches), 1);

    let second = ticker.tick(50_000_000);
    assert_eq!(second.acquisition_time_ms, 0.0, "the counter resets every tick");
    assert!(sink.is_empty());
}

#[test]
fn moving_an_entity_keeps_pending_actions() {
    let (mut d, sink, world) = setup(2);
    let a = PartitionKey::new(world, ChunkPos::new(0, 0));
    let b = PartitionKey::new(world, ChunkPos::new(1, 0));
    d.create_partition(a, Courier::default()).unwrap();
    d.create_partition(b, Courier::default()).unwrap();
    let entity = d.add_entity(EntityId(9), Courier::default(), a).unwrap();
    d.update_and_await(at(1));

    for _ in 0..4 {
        assert_eq!(entity.with_safe(|e| e.touches += 1), Access::Deferred);
    }
    d.move_entity(EntityId(9), b).unwrap();
    assert_eq!(entity.partition(), Some(b));
    assert_eq!(entity.sync(|e| e.touches), 4, "drained before rebinding");

    entity.with_safe(|e| e.touches += 10);
    d.update_and_await(at(2));
    d.update_and_await(at(3));

    assert_eq!(entity.sync(|e| e.touches), 14);
    assert_eq!(entity.sync(|e| e.touches_at_update.clone()), vec![0, 14, 14]);
    assert!(sink.is_empty());
}

#[test]
fn handle_queued_changes_apply_at_refresh() {
    let (mut d, _sink, world) = setup(2);
    let key = PartitionKey::new(world, ChunkPos::new(0, 0));
    let handle = d.handle();

    let chunk = std::thread::spawn(move || handle.create_partition(key, Courier::default()).unwrap())
        .join()
        .unwrap();
    assert_eq!(d.partition_count(), 0);
    assert_eq!(chunk.partition(), None);

    d.refresh_threads(Duration::ZERO);
    assert_eq!(d.partition_count(), 1);
    assert_eq!(chunk.partition(), Some(key));

    d.update_and_await(at(1));
    assert_eq!(chunk.sync(|c| c.touches_at_update.len()), 1);
}
