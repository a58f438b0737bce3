//! The worker pool and its per-tick barrier.
//!
//! [`ThreadDispatcher`] owns a fixed pool of worker threads and the arena
//! of partitions they run. The orchestrator calls
//! [`update_and_await`](ThreadDispatcher::update_and_await) once per tick
//! (dispatch and barrier), then
//! [`refresh_threads`](ThreadDispatcher::refresh_threads) (membership,
//! pruning, rebalancing). Both run on the orchestrating thread only, so
//! partition ownership and membership never change while a worker is
//! inside a tick.
//!
//! Membership can also be changed from any thread through a
//! [`DispatcherHandle`]; those changes are queued and applied at the next
//! `refresh_threads`.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use smallvec::SmallVec;
use thiserror::Error;
use tessera_core::{
    Domain, EngineError, EntityId, ErrorSink, InstanceId, PartitionKey, TickId, TickStart, WorkerId,
};
use tracing::{debug, error, info, warn};

use crate::acquirable::{rebind, AcquisitionStats, Acquirable};
use crate::assigner::{worker_loads, PartitionAssigner, PartitionLoad};
use crate::clock::monotonic_nanos;
use crate::config::{ConfigError, EngineConfig};
use crate::partition::{MembershipChange, PartitionSlot, PartitionUnit};
use crate::worker::{spawn_worker, WorkerReport, WorkerSlot, WorkerTask};

// ── Errors and stats ───────────────────────────────────────────────

/// Rejected membership operation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No partition with this key exists.
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionKey),
    /// The partition already has a chunk.
    #[error("partition {0} already exists")]
    DuplicatePartition(PartitionKey),
    /// No entity with this id is registered.
    #[error("unknown {0}")]
    UnknownEntity(EntityId),
    /// An entity with this id is already registered.
    #[error("{0} is already registered")]
    DuplicateEntity(EntityId),
    /// The dispatcher behind a [`DispatcherHandle`] is gone.
    #[error("dispatcher is shut down")]
    Closed,
}

/// Counters from one [`ThreadDispatcher::update_and_await`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Partitions dispatched to a live worker.
    pub partitions: usize,
    /// Entities updated.
    pub entities: usize,
    /// Deferred actions drained at safe points.
    pub deferred_actions: usize,
    /// Chunk or entity callbacks that failed.
    pub failures: usize,
    /// Workers that did not reach the barrier.
    pub workers_lost: usize,
}

impl DispatchStats {
    fn absorb(&mut self, report: &WorkerReport) {
        self.entities += report.entities;
        self.deferred_actions += report.deferred_actions;
        self.failures += report.failures;
    }
}

/// Counters from one [`ThreadDispatcher::refresh_threads`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Dead workers replaced.
    pub respawned_workers: usize,
    /// Queued membership changes applied.
    pub applied_changes: usize,
    /// Empty partitions removed.
    pub removed_partitions: usize,
    /// Partitions handed to another worker.
    pub migrations: usize,
}

// ── Worker handles ─────────────────────────────────────────────────

struct WorkerHandle<D: Domain> {
    slot: Arc<WorkerSlot>,
    tasks: Option<Sender<WorkerTask<D>>>,
    thread: Option<JoinHandle<()>>,
    lost: bool,
}

impl<D: Domain> WorkerHandle<D> {
    fn spawn(slot: Arc<WorkerSlot>, sink: &Arc<dyn ErrorSink>, prefix: &str) -> io::Result<Self> {
        let name = format!("{prefix}-worker-{}", slot.id().0);
        let (tasks, thread) = spawn_worker::<D>(Arc::clone(&slot), Arc::clone(sink), name)?;
        Ok(Self {
            slot,
            tasks: Some(tasks),
            thread: Some(thread),
            lost: false,
        })
    }

    fn is_dead(&self) -> bool {
        self.lost || self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

// ── ThreadDispatcher ───────────────────────────────────────────────

/// Fixed worker pool running partitions in parallel, one tick at a time.
pub struct ThreadDispatcher<D: Domain> {
    workers: Vec<WorkerHandle<D>>,
    /// Per-worker partition lists handed out each tick.
    assignments: Vec<Arc<[Arc<PartitionUnit<D>>]>>,
    assignments_dirty: bool,
    partitions: IndexMap<PartitionKey, PartitionSlot<D>>,
    /// Entity to owning partition.
    entities: IndexMap<EntityId, PartitionKey>,
    changes_tx: Sender<MembershipChange<D>>,
    changes_rx: Receiver<MembershipChange<D>>,
    assigner: PartitionAssigner,
    sink: Arc<dyn ErrorSink>,
    stats: Arc<AcquisitionStats>,
    stall_warning: Option<Duration>,
    thread_prefix: String,
    shut_down: bool,
}

impl<D: Domain> ThreadDispatcher<D> {
    /// Spawn the worker pool described by `config`.
    pub fn new(config: &EngineConfig, sink: Arc<dyn ErrorSink>) -> Result<Self, ConfigError> {
        config.validate()?;
        let worker_count = config.resolved_worker_count();
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let slot = Arc::new(WorkerSlot::new(WorkerId(i as u32)));
            let worker = WorkerHandle::spawn(slot, &sink, &config.thread_name_prefix).map_err(|e| {
                ConfigError::ThreadSpawnFailed {
                    reason: format!("dispatcher worker {i}: {e}"),
                }
            })?;
            workers.push(worker);
        }

        let assigner = PartitionAssigner::new(
            config.assignment.into_policy(),
            config.rebalance.clone(),
        );
        info!(
            workers = worker_count,
            policy = assigner.policy_name(),
            "dispatcher started"
        );

        let (changes_tx, changes_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            assignments: (0..worker_count).map(|_| Arc::from(Vec::new())).collect(),
            assignments_dirty: false,
            workers,
            partitions: IndexMap::new(),
            entities: IndexMap::new(),
            changes_tx,
            changes_rx,
            assigner,
            sink,
            stats: Arc::new(AcquisitionStats::default()),
            stall_warning: config.stall_warning(),
            thread_prefix: config.thread_name_prefix.clone(),
            shut_down: false,
        })
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Register a partition and its chunk; placement is decided by the
    /// assignment policy. Effective from the next dispatch.
    pub fn create_partition(
        &mut self,
        key: PartitionKey,
        chunk: D::Chunk,
    ) -> Result<Acquirable<D::Chunk>, DispatchError> {
        let handle = Acquirable::new(chunk);
        self.insert_partition(key, handle.clone())?;
        Ok(handle)
    }

    fn insert_partition(&mut self, key: PartitionKey, chunk: Acquirable<D::Chunk>) -> Result<(), DispatchError> {
        if let Some(slot) = self.partitions.get_mut(&key) {
            if slot.has_chunk() {
                return Err(DispatchError::DuplicatePartition(key));
            }
            // Chunk reloaded while its entities were still around.
            slot.set_chunk(chunk, self.sink.as_ref());
            self.assignments_dirty = true;
            return Ok(());
        }

        let owner = self.place(key);
        let token = self.workers[owner.index()].slot.token();
        let mut slot = PartitionSlot::new(key, owner, token, Arc::clone(&self.stats));
        slot.set_chunk(chunk, self.sink.as_ref());
        self.partitions.insert(key, slot);
        self.assignments_dirty = true;
        debug!(partition = %key, worker = %owner, "partition created");
        Ok(())
    }

    fn place(&mut self, key: PartitionKey) -> WorkerId {
        let loads = worker_loads(&self.partition_loads(), self.workers.len());
        self.assigner.assign(key, &loads)
    }

    /// Detach a partition's chunk and return it, unbound.
    ///
    /// The partition keeps running its entities until they leave; it is
    /// removed at the first `refresh_threads` that finds it empty.
    pub fn delete_partition(&mut self, key: PartitionKey) -> Result<Option<Acquirable<D::Chunk>>, DispatchError> {
        let slot = self
            .partitions
            .get_mut(&key)
            .ok_or(DispatchError::UnknownPartition(key))?;
        let chunk = slot.take_chunk(self.sink.as_ref());
        self.assignments_dirty = true;
        debug!(partition = %key, "partition chunk removed");
        Ok(chunk)
    }

    /// Register an entity inside an existing partition.
    pub fn add_entity(
        &mut self,
        id: EntityId,
        entity: D::Entity,
        key: PartitionKey,
    ) -> Result<Acquirable<D::Entity>, DispatchError> {
        let handle = Acquirable::new(entity);
        self.insert_entity(id, handle.clone(), key)?;
        Ok(handle)
    }

    fn insert_entity(
        &mut self,
        id: EntityId,
        entity: Acquirable<D::Entity>,
        key: PartitionKey,
    ) -> Result<(), DispatchError> {
        if self.entities.contains_key(&id) {
            return Err(DispatchError::DuplicateEntity(id));
        }
        let slot = self
            .partitions
            .get_mut(&key)
            .ok_or(DispatchError::UnknownPartition(key))?;
        slot.insert_entity(id, entity, self.sink.as_ref());
        self.entities.insert(id, key);
        self.assignments_dirty = true;
        Ok(())
    }

    /// Move an entity to another partition.
    ///
    /// Deferred actions still queued on the old partition run first, here
    /// on the orchestrator, so none is lost or run by two owners.
    pub fn move_entity(&mut self, id: EntityId, to: PartitionKey) -> Result<(), DispatchError> {
        let from = *self.entities.get(&id).ok_or(DispatchError::UnknownEntity(id))?;
        if from == to {
            return Ok(());
        }
        if !self.partitions.contains_key(&to) {
            return Err(DispatchError::UnknownPartition(to));
        }
        let entity = self
            .partitions
            .get_mut(&from)
            .and_then(|slot| slot.detach_entity(id))
            .ok_or(DispatchError::UnknownEntity(id))?;
        let target = self
            .partitions
            .get_mut(&to)
            .ok_or(DispatchError::UnknownPartition(to))?;
        target.insert_entity(id, entity, self.sink.as_ref());
        self.entities.insert(id, to);
        self.assignments_dirty = true;
        debug!(entity = %id, from = %from, to = %to, "entity moved");
        Ok(())
    }

    /// Unregister an entity and return it, unbound.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<Acquirable<D::Entity>, DispatchError> {
        let key = self
            .entities
            .shift_remove(&id)
            .ok_or(DispatchError::UnknownEntity(id))?;
        let entity = self
            .partitions
            .get_mut(&key)
            .and_then(|slot| slot.detach_entity(id))
            .ok_or(DispatchError::UnknownEntity(id))?;
        rebind(&entity, None, self.sink.as_ref());
        self.assignments_dirty = true;
        Ok(entity)
    }

    /// Drop every partition and entity of `instance`. Returns how many
    /// partitions were removed.
    pub fn remove_instance(&mut self, instance: InstanceId) -> usize {
        let keys: Vec<PartitionKey> = self
            .partitions
            .keys()
            .filter(|k| k.instance == instance)
            .copied()
            .collect();
        self.entities.retain(|_, key| key.instance != instance);
        for key in &keys {
            if let Some(slot) = self.partitions.shift_remove(key) {
                slot.retire(self.sink.as_ref());
            }
        }
        if !keys.is_empty() {
            self.assignments_dirty = true;
            debug!(%instance, partitions = keys.len(), "instance partitions removed");
        }
        keys.len()
    }

    /// A cloneable, thread-safe handle that queues membership changes.
    pub fn handle(&self) -> DispatcherHandle<D> {
        DispatcherHandle {
            tx: self.changes_tx.clone(),
        }
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Run one tick on every partition and wait for all of them.
    ///
    /// Each worker first drains the deferred actions of its partitions,
    /// then updates them; failures are isolated per chunk and per entity
    /// and reported to the sink. Returns once every dispatched worker has
    /// reported, or has died (reported as [`EngineError::WorkerLost`]).
    pub fn update_and_await(&mut self, start: TickStart) -> DispatchStats {
        let mut stats = DispatchStats::default();
        if self.shut_down {
            return stats;
        }
        self.rebuild_assignments();

        let (done_tx, done_rx) = crossbeam_channel::bounded(self.workers.len().max(1));
        let mut pending: SmallVec<[WorkerId; 16]> = SmallVec::new();

        for (worker, units) in self.workers.iter_mut().zip(&self.assignments) {
            if units.is_empty() {
                continue;
            }
            let id = worker.slot.id();
            let task = WorkerTask::Tick {
                start,
                units: Arc::clone(units),
                done: done_tx.clone(),
            };
            let sent = worker.tasks.as_ref().is_some_and(|tx| tx.send(task).is_ok());
            if sent {
                pending.push(id);
                stats.partitions += units.len();
            } else {
                worker.lost = true;
                stats.workers_lost += 1;
                warn!(worker = %id, tick = %start.tick, "worker unavailable, its partitions skip this tick");
                self.sink.handle(&EngineError::WorkerLost {
                    worker: id,
                    tick: start.tick,
                });
            }
        }
        drop(done_tx);

        let waiting_since = Instant::now();
        let mut stall_reported = false;
        while !pending.is_empty() {
            let received = match self.stall_warning {
                None => done_rx.recv().ok(),
                Some(period) => match done_rx.recv_timeout(period) {
                    Ok(report) => Some(report),
                    Err(RecvTimeoutError::Timeout) => {
                        self.report_stall(start.tick, &pending, waiting_since.elapsed(), !stall_reported);
                        stall_reported = true;
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => None,
                },
            };
            // Disconnected: every live worker has reported, the rest died.
            let Some(report) = received else {
                break;
            };
            if let Some(worker) = report.worker {
                pending.retain(|w| *w != worker);
            }
            stats.absorb(&report);
            for (key, cost) in &report.costs {
                if let Some(slot) = self.partitions.get_mut(key) {
                    slot.record_cost(*cost);
                }
            }
        }

        for worker in pending {
            self.workers[worker.index()].lost = true;
            stats.workers_lost += 1;
            warn!(worker = %worker, tick = %start.tick, "worker died before reaching the barrier");
            self.sink.handle(&EngineError::WorkerLost {
                worker,
                tick: start.tick,
            });
        }

        stats
    }

    fn report_stall(&self, tick: TickId, pending: &[WorkerId], waited: Duration, notify: bool) {
        let now = monotonic_nanos();
        for worker in pending {
            let busy_ms = self.workers[worker.index()]
                .slot
                .busy_for_ns(now)
                .map(|ns| ns / 1_000_000);
            warn!(worker = %worker, %tick, ?busy_ms, "worker has not reached the barrier");
        }
        if notify {
            self.sink.handle(&EngineError::BarrierStalled {
                tick,
                waited_ms: waited.as_millis() as u64,
                workers: pending.iter().copied().collect(),
            });
        }
    }

    /// Between-tick maintenance on the orchestrator.
    ///
    /// Replaces dead workers, applies queued membership changes, prunes
    /// empty partitions, rebalances using `observed` (the duration of the
    /// tick that just ran), and rebuilds the per-worker partition lists.
    /// Everything here takes effect from the next dispatch.
    pub fn refresh_threads(&mut self, observed: Duration) -> RefreshStats {
        let mut stats = RefreshStats::default();
        if !self.shut_down {
            stats.respawned_workers = self.respawn_dead_workers();
        }
        stats.applied_changes = self.apply_queued_changes();
        stats.removed_partitions = self.prune_empty_partitions();
        stats.migrations = self.rebalance(observed);
        self.rebuild_assignments();
        stats
    }

    fn respawn_dead_workers(&mut self) -> usize {
        let mut respawned = 0;
        for worker in &mut self.workers {
            if !worker.is_dead() {
                continue;
            }
            let id = worker.slot.id();
            worker.tasks = None;
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!(worker = %id, "worker thread panicked");
                }
            }
            match WorkerHandle::<D>::spawn(Arc::clone(&worker.slot), &self.sink, &self.thread_prefix) {
                Ok(fresh) => {
                    *worker = fresh;
                    respawned += 1;
                    info!(worker = %id, "worker respawned");
                }
                Err(e) => error!(worker = %id, error = %e, "failed to respawn worker, retrying next tick"),
            }
        }
        respawned
    }

    fn apply_queued_changes(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(change) = self.changes_rx.try_recv() {
            let result = match change {
                MembershipChange::CreatePartition { key, chunk } => self.insert_partition(key, chunk),
                MembershipChange::DeletePartition(key) => self.delete_partition(key).map(drop),
                MembershipChange::AddEntity { id, entity, key } => self.insert_entity(id, entity, key),
                MembershipChange::MoveEntity { id, key } => self.move_entity(id, key),
                MembershipChange::RemoveEntity(id) => self.remove_entity(id).map(drop),
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => warn!(error = %e, "dropping queued membership change"),
            }
        }
        applied
    }

    fn prune_empty_partitions(&mut self) -> usize {
        let empty: SmallVec<[PartitionKey; 8]> = self
            .partitions
            .values()
            .filter(|slot| slot.is_empty())
            .map(|slot| slot.key())
            .collect();
        for key in &empty {
            if let Some(slot) = self.partitions.shift_remove(key) {
                let drained = slot.retire(self.sink.as_ref());
                debug!(partition = %key, drained, "empty partition removed");
            }
        }
        if !empty.is_empty() {
            self.assignments_dirty = true;
        }
        empty.len()
    }

    fn rebalance(&mut self, observed: Duration) -> usize {
        let loads = self.partition_loads();
        let plan = self
            .assigner
            .plan_rebalance(&loads, self.workers.len(), observed);
        for m in &plan {
            let token = self.workers[m.to.index()].slot.token();
            if let Some(slot) = self.partitions.get_mut(&m.key) {
                slot.migrate(m.to, token);
                debug!(partition = %m.key, from = %m.from, to = %m.to, "partition migrated");
            }
        }
        if !plan.is_empty() {
            self.assignments_dirty = true;
        }
        plan.len()
    }

    fn partition_loads(&self) -> Vec<PartitionLoad> {
        self.partitions
            .values()
            .map(|slot| PartitionLoad {
                key: slot.key(),
                owner: slot.owner(),
                cost_ns: slot.cost_ns(),
            })
            .collect()
    }

    fn rebuild_assignments(&mut self) {
        if !self.assignments_dirty {
            return;
        }
        let mut lists: Vec<Vec<Arc<PartitionUnit<D>>>> =
            (0..self.workers.len()).map(|_| Vec::new()).collect();
        for slot in self.partitions.values_mut() {
            lists[slot.owner().index()].push(slot.unit());
        }
        self.assignments = lists.into_iter().map(Arc::from).collect();
        self.assignments_dirty = false;
    }

    // ── Queries ────────────────────────────────────────────────────

    /// The worker owning `key`.
    pub fn owner_of(&self, key: PartitionKey) -> Option<WorkerId> {
        self.partitions.get(&key).map(PartitionSlot::owner)
    }

    /// The partition an entity lives in.
    pub fn partition_of(&self, id: EntityId) -> Option<PartitionKey> {
        self.entities.get(&id).copied()
    }

    /// The chunk of a partition.
    pub fn chunk(&self, key: PartitionKey) -> Option<&Acquirable<D::Chunk>> {
        self.partitions.get(&key)?.chunk()
    }

    /// A registered entity.
    pub fn entity(&self, id: EntityId) -> Option<&Acquirable<D::Entity>> {
        let key = self.entities.get(&id)?;
        self.partitions.get(key)?.entity(id)
    }

    /// Every registered entity with its partition, in registration order.
    pub fn entities(&self) -> impl Iterator<Item = (EntityId, PartitionKey, &Acquirable<D::Entity>)> + '_ {
        self.entities.iter().filter_map(|(id, key)| {
            let entity = self.partitions.get(key)?.entity(*id)?;
            Some((*id, *key, entity))
        })
    }

    /// Keys of every live partition, in creation order.
    pub fn partition_keys(&self) -> impl Iterator<Item = PartitionKey> + '_ {
        self.partitions.keys().copied()
    }

    /// Number of live partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Number of registered entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Size of the worker pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Membership changes queued through handles, not yet applied.
    pub fn pending_changes(&self) -> usize {
        self.changes_rx.len()
    }

    /// Time spent blocked on contended acquirables since the last call,
    /// in nanoseconds. Resets the counter.
    pub fn take_acquisition_nanos(&self) -> u64 {
        self.stats.take()
    }

    /// Close the worker channels and join every worker.
    ///
    /// Idempotent. Returns the number of workers joined cleanly by this
    /// call. Later dispatches are no-ops.
    pub fn shutdown(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        self.shut_down = true;
        for worker in &mut self.workers {
            worker.tasks = None;
        }
        let mut joined = 0;
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_ok() {
                    joined += 1;
                }
            }
        }
        info!(joined, "dispatcher shut down");
        joined
    }
}

impl<D: Domain> Drop for ThreadDispatcher<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: Domain> fmt::Debug for ThreadDispatcher<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDispatcher")
            .field("workers", &self.workers.len())
            .field("partitions", &self.partitions.len())
            .field("entities", &self.entities.len())
            .field("assigner", &self.assigner)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

// ── DispatcherHandle ───────────────────────────────────────────────

/// Queues membership changes from any thread.
///
/// Changes are applied, in send order, at the dispatcher's next
/// `refresh_threads`. Changes that turn out to be invalid then (unknown
/// partition, duplicate id) are logged and dropped.
pub struct DispatcherHandle<D: Domain> {
    tx: Sender<MembershipChange<D>>,
}

impl<D: Domain> Clone for DispatcherHandle<D> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<D: Domain> fmt::Debug for DispatcherHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl<D: Domain> DispatcherHandle<D> {
    /// Queue a new partition. The returned chunk handle is unbound until
    /// the change is applied.
    pub fn create_partition(&self, key: PartitionKey, chunk: D::Chunk) -> Result<Acquirable<D::Chunk>, DispatchError> {
        let chunk = Acquirable::new(chunk);
        self.send(MembershipChange::CreatePartition {
            key,
            chunk: chunk.clone(),
        })?;
        Ok(chunk)
    }

    /// Queue removal of a partition's chunk.
    pub fn delete_partition(&self, key: PartitionKey) -> Result<(), DispatchError> {
        self.send(MembershipChange::DeletePartition(key))
    }

    /// Queue a new entity.
    pub fn add_entity(
        &self,
        id: EntityId,
        entity: D::Entity,
        key: PartitionKey,
    ) -> Result<Acquirable<D::Entity>, DispatchError> {
        let entity = Acquirable::new(entity);
        self.send(MembershipChange::AddEntity {
            id,
            entity: entity.clone(),
            key,
        })?;
        Ok(entity)
    }

    /// Queue an entity move.
    pub fn move_entity(&self, id: EntityId, key: PartitionKey) -> Result<(), DispatchError> {
        self.send(MembershipChange::MoveEntity { id, key })
    }

    /// Queue an entity removal.
    pub fn remove_entity(&self, id: EntityId) -> Result<(), DispatchError> {
        self.send(MembershipChange::RemoveEntity(id))
    }

    fn send(&self, change: MembershipChange<D>) -> Result<(), DispatchError> {
        self.tx.send(change).map_err(|_| DispatchError::Closed)
    }
}
