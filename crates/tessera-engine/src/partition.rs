//! Partitions: the unit of ownership handed to workers.
//!
//! The dispatcher keeps one [`PartitionSlot`] per spatial key in its
//! arena. Workers never see the slot: they receive an immutable
//! [`PartitionUnit`] snapshot of its membership, rebuilt by the
//! orchestrator whenever membership changes (only between ticks).

use std::sync::Arc;

use indexmap::IndexMap;
use tessera_core::{Domain, EntityId, ErrorSink, PartitionKey, TickStart, Tickable, UnitKind, WorkerId};

use crate::acquirable::{rebind, AcquisitionStats, Acquirable, OwnerBinding};
use crate::isolate::run_isolated;

// ── Worker-facing unit ─────────────────────────────────────────

/// Counters from running one partition for one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct UnitOutcome {
    pub entities: usize,
    pub failures: usize,
}

/// Frozen membership of one partition, as seen by its owning worker.
pub(crate) struct PartitionUnit<D: Domain> {
    key: PartitionKey,
    binding: Arc<OwnerBinding>,
    chunk: Option<Acquirable<D::Chunk>>,
    entities: Vec<(EntityId, Acquirable<D::Entity>)>,
}

impl<D: Domain> PartitionUnit<D> {
    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn binding(&self) -> &Arc<OwnerBinding> {
        &self.binding
    }

    /// Update the chunk, then every entity, each isolated.
    ///
    /// A failing chunk does not skip the entities and vice versa; a
    /// failing unit keeps whatever state it had reached.
    pub fn run(&self, tick: TickStart, sink: &dyn ErrorSink) -> UnitOutcome {
        let mut outcome = UnitOutcome::default();

        if let Some(chunk) = &self.chunk {
            let ok = run_isolated(
                sink,
                || UnitKind::Partition(self.key),
                || chunk.sync(|c| c.update(tick)),
            );
            if !ok {
                outcome.failures += 1;
            }
        }

        for (id, entity) in &self.entities {
            outcome.entities += 1;
            let ok = run_isolated(
                sink,
                || UnitKind::Entity {
                    entity: *id,
                    partition: self.key,
                },
                || entity.sync(|e| e.update(tick)),
            );
            if !ok {
                outcome.failures += 1;
            }
        }

        outcome
    }
}

// ── Orchestrator-side slot ─────────────────────────────────────

/// Weight of the newest sample in the cost moving average, in 1/8ths.
const COST_SAMPLE_WEIGHT: u64 = 2;

/// One entry of the dispatcher's partition arena.
pub(crate) struct PartitionSlot<D: Domain> {
    key: PartitionKey,
    binding: Arc<OwnerBinding>,
    chunk: Option<Acquirable<D::Chunk>>,
    entities: IndexMap<EntityId, Acquirable<D::Entity>>,
    /// Exponential moving average of measured callback time.
    cost_ns: u64,
    /// Cached worker view; `None` after a membership change.
    unit: Option<Arc<PartitionUnit<D>>>,
}

impl<D: Domain> PartitionSlot<D> {
    pub fn new(key: PartitionKey, owner: WorkerId, token: u64, stats: Arc<AcquisitionStats>) -> Self {
        Self {
            key,
            binding: Arc::new(OwnerBinding::new(key, owner, token, stats)),
            chunk: None,
            entities: IndexMap::new(),
            cost_ns: 0,
            unit: None,
        }
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn owner(&self) -> WorkerId {
        self.binding.owner()
    }

    pub fn binding(&self) -> &Arc<OwnerBinding> {
        &self.binding
    }

    pub fn cost_ns(&self) -> u64 {
        self.cost_ns
    }

    /// No chunk and no entities: eligible for pruning.
    pub fn is_empty(&self) -> bool {
        self.chunk.is_none() && self.entities.is_empty()
    }

    pub fn has_chunk(&self) -> bool {
        self.chunk.is_some()
    }

    pub fn chunk(&self) -> Option<&Acquirable<D::Chunk>> {
        self.chunk.as_ref()
    }

    pub fn entity(&self, id: EntityId) -> Option<&Acquirable<D::Entity>> {
        self.entities.get(&id)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Attach a chunk, binding it to this partition.
    pub fn set_chunk(&mut self, chunk: Acquirable<D::Chunk>, sink: &dyn ErrorSink) {
        rebind(&chunk, Some(Arc::clone(&self.binding)), sink);
        self.chunk = Some(chunk);
        self.unit = None;
    }

    /// Detach the chunk, leaving it unbound.
    pub fn take_chunk(&mut self, sink: &dyn ErrorSink) -> Option<Acquirable<D::Chunk>> {
        let chunk = self.chunk.take()?;
        rebind(&chunk, None, sink);
        self.unit = None;
        Some(chunk)
    }

    /// Bind `entity` here. The caller keeps the entity index in sync.
    pub fn insert_entity(&mut self, id: EntityId, entity: Acquirable<D::Entity>, sink: &dyn ErrorSink) {
        rebind(&entity, Some(Arc::clone(&self.binding)), sink);
        self.entities.insert(id, entity);
        self.unit = None;
    }

    /// Remove an entity without touching its binding.
    ///
    /// The caller rebinds it (to another partition, or to nothing).
    pub fn detach_entity(&mut self, id: EntityId) -> Option<Acquirable<D::Entity>> {
        let entity = self.entities.shift_remove(&id)?;
        self.unit = None;
        Some(entity)
    }

    /// Hand the partition to another worker, effective next tick.
    ///
    /// Pending deferred actions stay queued and are drained by the new
    /// owner at its safe point.
    pub fn migrate(&mut self, to: WorkerId, token: u64) {
        self.binding.set_owner(to, token);
    }

    pub fn record_cost(&mut self, sample_ns: u64) {
        self.cost_ns = if self.cost_ns == 0 {
            sample_ns
        } else {
            (self.cost_ns * (8 - COST_SAMPLE_WEIGHT) + sample_ns * COST_SAMPLE_WEIGHT) / 8
        };
    }

    /// The worker view of this partition, rebuilt if membership changed.
    pub fn unit(&mut self) -> Arc<PartitionUnit<D>> {
        if let Some(unit) = &self.unit {
            return Arc::clone(unit);
        }
        let unit = Arc::new(PartitionUnit {
            key: self.key,
            binding: Arc::clone(&self.binding),
            chunk: self.chunk.clone(),
            entities: self
                .entities
                .iter()
                .map(|(id, e)| (*id, e.clone()))
                .collect(),
        });
        self.unit = Some(Arc::clone(&unit));
        unit
    }

    /// Unbind everything left and run the partition's outstanding actions.
    pub fn retire(mut self, sink: &dyn ErrorSink) -> usize {
        let mut drained = 0;
        if let Some(chunk) = self.chunk.take() {
            drained += rebind(&chunk, None, sink);
        }
        for (_, entity) in self.entities.drain(..) {
            drained += rebind(&entity, None, sink);
        }
        drained + self.binding.drain(sink)
    }
}

// ── Queued membership changes ──────────────────────────────────

/// A membership change queued through a `DispatcherHandle`.
///
/// Applied by the orchestrator at the next `refresh_threads`.
pub(crate) enum MembershipChange<D: Domain> {
    CreatePartition {
        key: PartitionKey,
        chunk: Acquirable<D::Chunk>,
    },
    DeletePartition(PartitionKey),
    AddEntity {
        id: EntityId,
        entity: Acquirable<D::Entity>,
        key: PartitionKey,
    },
    MoveEntity {
        id: EntityId,
        key: PartitionKey,
    },
    RemoveEntity(EntityId),
}
