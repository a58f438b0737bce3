//! Immutable point-in-time views for readers outside the tick loop.
//!
//! [`SnapshotCoordinator::update_snapshot`] walks the live instances and
//! entities and asks a [`SnapshotUpdater`] for one write-once
//! [`SnapshotRef`] per object. The resulting [`ServerSnapshot`] is
//! read-only: the set of objects it lists is fixed when it is built, and
//! each holder is filled at most once, by whichever thread owns the
//! object.
//!
//! Entity holders filled through [`Acquirable::with_safe`] from the
//! orchestrator are populated by the owning worker at its next safe point,
//! so a freshly built snapshot may report [`ServerSnapshot::is_complete`]
//! as `false` until the next tick has started.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use tessera_core::{Domain, EntityId, InstanceId, TickId};

use crate::acquirable::Acquirable;
use crate::dispatcher::ThreadDispatcher;

// ── SnapshotRef ────────────────────────────────────────────────────

/// Write-once holder shared between a snapshot and its producer.
pub struct SnapshotRef<S> {
    cell: Arc<OnceLock<S>>,
}

impl<S> Clone for SnapshotRef<S> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<S> Default for SnapshotRef<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SnapshotRef<S> {
    /// An empty holder.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// A holder filled with `value`.
    pub fn filled(value: S) -> Self {
        Self {
            cell: Arc::new(OnceLock::from(value)),
        }
    }

    /// Fill the holder. Returns `false` (dropping `value`) if it was
    /// already filled.
    pub fn set(&self, value: S) -> bool {
        self.cell.set(value).is_ok()
    }

    /// The captured value, once filled.
    pub fn get(&self) -> Option<&S> {
        self.cell.get()
    }

    /// Whether the holder has been filled.
    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<S: fmt::Debug> fmt::Debug for SnapshotRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotRef").field(&self.cell.get()).finish()
    }
}

// ── SnapshotUpdater ────────────────────────────────────────────────

/// Produces the write-once holders a snapshot is built from.
pub trait SnapshotUpdater<D: Domain> {
    /// Snapshot of one instance.
    type InstanceSnapshot: Send + Sync + 'static;
    /// Snapshot of one entity.
    type EntitySnapshot: Send + Sync + 'static;

    /// Holder for an instance. Called on the orchestrator, which owns
    /// instances, so it may be filled immediately.
    fn instance(&mut self, id: InstanceId, instance: &D::Instance) -> SnapshotRef<Self::InstanceSnapshot>;

    /// Holder for an entity. The entity is owned by a worker; fill the
    /// holder through the handle.
    fn entity(&mut self, id: EntityId, entity: &Acquirable<D::Entity>) -> SnapshotRef<Self::EntitySnapshot>;
}

type CaptureEntity<D, E> = Arc<dyn Fn(EntityId, &<D as Domain>::Entity) -> E + Send + Sync>;

/// [`SnapshotUpdater`] built from two capture functions.
///
/// Instances are captured immediately; entities are captured with
/// [`Acquirable::with_safe`], so on the orchestrator they are filled by
/// the owning worker at its next safe point.
pub struct CapturingUpdater<D: Domain, I, E> {
    capture_instance: Box<dyn FnMut(InstanceId, &D::Instance) -> I + Send>,
    capture_entity: CaptureEntity<D, E>,
    _domain: PhantomData<fn() -> D>,
}

impl<D: Domain, I, E> CapturingUpdater<D, I, E> {
    /// Create an updater from the two capture functions.
    pub fn new(
        capture_instance: impl FnMut(InstanceId, &D::Instance) -> I + Send + 'static,
        capture_entity: impl Fn(EntityId, &D::Entity) -> E + Send + Sync + 'static,
    ) -> Self {
        Self {
            capture_instance: Box::new(capture_instance),
            capture_entity: Arc::new(capture_entity),
            _domain: PhantomData,
        }
    }
}

impl<D, I, E> SnapshotUpdater<D> for CapturingUpdater<D, I, E>
where
    D: Domain,
    I: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    type InstanceSnapshot = I;
    type EntitySnapshot = E;

    fn instance(&mut self, id: InstanceId, instance: &D::Instance) -> SnapshotRef<I> {
        SnapshotRef::filled((self.capture_instance)(id, instance))
    }

    fn entity(&mut self, id: EntityId, entity: &Acquirable<D::Entity>) -> SnapshotRef<E> {
        let holder = SnapshotRef::new();
        let fill = holder.clone();
        let capture = Arc::clone(&self.capture_entity);
        entity.with_safe(move |e| {
            fill.set(capture(id, e));
        });
        holder
    }
}

// ── ServerSnapshot ─────────────────────────────────────────────────

struct SnapshotData<I, E> {
    tick: TickId,
    instances: IndexMap<InstanceId, SnapshotRef<I>>,
    entities: IndexMap<EntityId, (InstanceId, SnapshotRef<E>)>,
}

/// Read-only aggregate of snapshot holders. Cheap to clone and share.
pub struct ServerSnapshot<I, E> {
    inner: Arc<SnapshotData<I, E>>,
}

impl<I, E> Clone for ServerSnapshot<I, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, E> fmt::Debug for ServerSnapshot<I, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSnapshot")
            .field("tick", &self.inner.tick)
            .field("instances", &self.inner.instances.len())
            .field("entities", &self.inner.entities.len())
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<I, E> ServerSnapshot<I, E> {
    /// The last tick completed when the snapshot was built.
    pub fn tick(&self) -> TickId {
        self.inner.tick
    }

    /// Every instance with its captured value, if filled yet.
    pub fn instances(&self) -> impl Iterator<Item = (InstanceId, Option<&I>)> + '_ {
        self.inner.instances.iter().map(|(id, r)| (*id, r.get()))
    }

    /// One instance's captured value.
    pub fn instance(&self, id: InstanceId) -> Option<&I> {
        self.inner.instances.get(&id)?.get()
    }

    /// One entity's captured value.
    pub fn entity(&self, id: EntityId) -> Option<&E> {
        self.inner.entities.get(&id)?.1.get()
    }

    /// The entities of one instance, in registration order.
    pub fn entities_of(&self, instance: InstanceId) -> impl Iterator<Item = (EntityId, Option<&E>)> + '_ {
        self.inner
            .entities
            .iter()
            .filter(move |(_, (owner, _))| *owner == instance)
            .map(|(id, (_, r))| (*id, r.get()))
    }

    /// Number of instances listed.
    pub fn instance_count(&self) -> usize {
        self.inner.instances.len()
    }

    /// Number of entities listed.
    pub fn entity_count(&self) -> usize {
        self.inner.entities.len()
    }

    /// Whether every holder has been filled.
    pub fn is_complete(&self) -> bool {
        self.inner.instances.values().all(SnapshotRef::is_set)
            && self.inner.entities.values().all(|(_, r)| r.is_set())
    }
}

// ── SnapshotCoordinator ────────────────────────────────────────────

/// Builds [`ServerSnapshot`]s. Performs no locking of its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotCoordinator;

impl SnapshotCoordinator {
    /// Walk every live instance and each of its entities, collecting
    /// one holder per object from `updater`.
    ///
    /// Entities whose instance is not registered are skipped.
    pub fn update_snapshot<D, U>(
        tick: TickId,
        instances: &IndexMap<InstanceId, D::Instance>,
        dispatcher: &ThreadDispatcher<D>,
        updater: &mut U,
    ) -> ServerSnapshot<U::InstanceSnapshot, U::EntitySnapshot>
    where
        D: Domain,
        U: SnapshotUpdater<D>,
    {
        let instance_refs = instances
            .iter()
            .map(|(id, instance)| (*id, updater.instance(*id, instance)))
            .collect();
        let entity_refs = dispatcher
            .entities()
            .filter(|(_, key, _)| instances.contains_key(&key.instance))
            .map(|(id, key, entity)| (id, (key.instance, updater.entity(id, entity))))
            .collect();
        ServerSnapshot {
            inner: Arc::new(SnapshotData {
                tick,
                instances: instance_refs,
                entities: entity_refs,
            }),
        }
    }
}
