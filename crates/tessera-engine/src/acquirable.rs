//! Ownership-aware handles with deferred cross-thread access.
//!
//! An [`Acquirable`] wraps one logical object (a chunk or an entity).
//! While bound to a partition, only the worker owning that partition
//! mutates it directly; every other thread queues a deferred action on
//! the object, and the partition's owner binding is told the object has
//! work waiting. The owner drains those objects at its next safe point
//! (the start of its next tick, before any partition update).
//!
//! The value itself sits behind a `Mutex` so that the owner fast path and
//! the blocking [`Acquirable::sync`] escape hatch are memory-safe. The
//! mutex is uncontended on the fast path; contended waits are measured
//! and accumulated in `AcquisitionStats` for the per-tick monitor.
//!
//! Each thread also records which objects it currently has locked, so an
//! object reaching back into itself (an entity calling `with_safe` on its
//! own handle from `update`) is deferred instead of locking twice.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use smallvec::SmallVec;
use tessera_core::{ErrorSink, PartitionKey, UnitKind, WorkerId};

use crate::isolate::run_isolated;
use crate::worker::current_token;

// ── Acquisition accounting ─────────────────────────────────────

/// Accumulated time threads spent blocked on contended acquirable locks.
///
/// Shared by every binding of one dispatcher; consumed and reset once
/// per tick by the monitor.
#[derive(Debug, Default)]
pub(crate) struct AcquisitionStats {
    blocked_ns: AtomicU64,
}

impl AcquisitionStats {
    fn record(&self, nanos: u64) {
        self.blocked_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Return the accumulated nanoseconds and reset the counter to zero.
    pub fn take(&self) -> u64 {
        self.blocked_ns.swap(0, Ordering::Relaxed)
    }
}

/// Lock `value`, charging any contended wait to `stats`.
fn lock_value<'a, T>(value: &'a Mutex<T>, stats: Option<&AcquisitionStats>) -> MutexGuard<'a, T> {
    match value.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => {
            let began = Instant::now();
            let guard = value.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(stats) = stats {
                stats.record(began.elapsed().as_nanos() as u64);
            }
            guard
        }
    }
}

// ── Held objects ───────────────────────────────────────────────

thread_local! {
    /// Addresses of the objects whose value this thread has locked,
    /// innermost last.
    static HELD: RefCell<SmallVec<[usize; 4]>> = RefCell::new(SmallVec::new());
}

/// Marks one object as locked by this thread until dropped.
struct HeldMark(usize);

impl HeldMark {
    fn new(addr: usize) -> Self {
        HELD.with(|held| held.borrow_mut().push(addr));
        Self(addr)
    }
}

impl Drop for HeldMark {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(at) = held.iter().rposition(|&a| a == self.0) {
                held.remove(at);
            }
        });
    }
}

fn is_held_here(addr: usize) -> bool {
    HELD.with(|held| held.borrow().contains(&addr))
}

// ── Owner binding ──────────────────────────────────────────────

/// An object with deferred actions waiting, type-erased so one binding
/// can track chunks and entities alike.
pub(crate) trait PendingActions: Send + Sync {
    /// Run the actions queued on this object so far, isolating each one,
    /// provided the object is still bound to `binding`. Returns how many
    /// ran.
    fn drain_for(&self, binding: &OwnerBinding, sink: &dyn ErrorSink) -> usize;
}

/// The ownership record shared by a partition and every acquirable in it.
///
/// Owner fields change only on the orchestrator between ticks (migration).
/// The notice queue is multi-producer (any thread calling `with_safe`)
/// and single-consumer (the owner at its safe point, or the orchestrator
/// when the binding is being retired). Actions themselves live on the
/// object they target, so moving one object never runs another's.
pub(crate) struct OwnerBinding {
    key: PartitionKey,
    owner_token: AtomicU64,
    owner_id: AtomicU32,
    notice_tx: Sender<Arc<dyn PendingActions>>,
    notice_rx: Receiver<Arc<dyn PendingActions>>,
    stats: Arc<AcquisitionStats>,
}

impl OwnerBinding {
    pub fn new(key: PartitionKey, owner: WorkerId, token: u64, stats: Arc<AcquisitionStats>) -> Self {
        let (notice_tx, notice_rx) = crossbeam_channel::unbounded();
        Self {
            key,
            owner_token: AtomicU64::new(token),
            owner_id: AtomicU32::new(owner.0),
            notice_tx,
            notice_rx,
            stats,
        }
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn owner(&self) -> WorkerId {
        WorkerId(self.owner_id.load(Ordering::Acquire))
    }

    pub fn is_current_owner(&self) -> bool {
        self.owner_token.load(Ordering::Acquire) == current_token()
    }

    /// Hand the partition to another worker. Orchestrator only, between ticks.
    pub fn set_owner(&self, owner: WorkerId, token: u64) {
        self.owner_id.store(owner.0, Ordering::Release);
        self.owner_token.store(token, Ordering::Release);
    }

    pub fn stats(&self) -> &Arc<AcquisitionStats> {
        &self.stats
    }

    fn notify(&self, object: Arc<dyn PendingActions>) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.notice_tx.send(object);
    }

    /// Number of deferrals announced since the last drain.
    ///
    /// An object that moved away leaves its notices behind; they drain
    /// as no-ops, since its actions now belong to its new owner.
    pub fn pending(&self) -> usize {
        self.notice_rx.len()
    }

    /// Run the deferred actions of every object announced so far.
    ///
    /// Actions an object queues on itself while draining wait for the
    /// next safe point. Returns how many actions ran.
    pub fn drain(&self, sink: &dyn ErrorSink) -> usize {
        let notices = self.notice_rx.len();
        let mut ran = 0;
        for _ in 0..notices {
            let Ok(object) = self.notice_rx.try_recv() else {
                break;
            };
            ran += object.drain_for(self, sink);
        }
        ran
    }
}

impl fmt::Debug for OwnerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerBinding")
            .field("key", &self.key)
            .field("owner", &self.owner())
            .field("pending", &self.pending())
            .finish()
    }
}

// ── Acquirable ─────────────────────────────────────────────────

/// How a [`Acquirable::with_safe`] call was carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// The action ran synchronously on the calling thread.
    Immediate,
    /// The action was queued: for the owning worker's next safe point, or
    /// (on an unbound object this thread is already inside) until that
    /// outer access returns.
    Deferred,
}

type Action<T> = Box<dyn FnOnce(&mut T) + Send>;

struct Shared<T> {
    value: Mutex<T>,
    binding: RwLock<Option<Arc<OwnerBinding>>>,
    queue_tx: Sender<Action<T>>,
    queue_rx: Receiver<Action<T>>,
}

impl<T> Shared<T> {
    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn is_bound(&self) -> bool {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn is_bound_to(&self, binding: &OwnerBinding) -> bool {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|b| std::ptr::eq(Arc::as_ptr(b), binding))
    }

    /// Lock the value and run `f`, marking the object held meanwhile.
    fn hold<R>(&self, stats: Option<&AcquisitionStats>, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut value = lock_value(&self.value, stats);
            let _mark = HeldMark::new(self.addr());
            f(&mut *value)
        };
        // Re-entrant calls on an unbound object have no owner to wait
        // for; they run once the outermost access lets go.
        if !self.queue_rx.is_empty() && !is_held_here(self.addr()) && !self.is_bound() {
            let queued = self.queue_rx.len();
            for _ in 0..queued {
                let Ok(action) = self.queue_rx.try_recv() else {
                    break;
                };
                self.hold(None, action);
            }
        }
        result
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Run the actions queued so far under `key`, isolating each one.
    fn run_queued(&self, key: PartitionKey, stats: &AcquisitionStats, sink: &dyn ErrorSink) -> usize {
        let queued = self.queue_rx.len();
        let mut ran = 0;
        for _ in 0..queued {
            let Ok(action) = self.queue_rx.try_recv() else {
                break;
            };
            run_isolated(
                sink,
                || UnitKind::Deferred(key),
                || {
                    self.hold(Some(stats), action);
                    Ok(())
                },
            );
            ran += 1;
        }
        ran
    }
}

impl<T: Send + 'static> PendingActions for Shared<T> {
    fn drain_for(&self, binding: &OwnerBinding, sink: &dyn ErrorSink) -> usize {
        if !self.is_bound_to(binding) {
            return 0;
        }
        self.run_queued(binding.key(), binding.stats(), sink)
    }
}

/// Handle to an object owned by whichever worker owns its partition.
///
/// Cloning the handle is cheap and yields another handle to the same
/// object. Handles returned by the dispatcher are bound to their
/// partition; a handle created with [`Acquirable::new`] and never
/// registered is unbound, and unbound handles run every action
/// immediately on the calling thread.
///
/// # Re-entrancy
///
/// [`with_safe`](Self::with_safe) called on an object from inside an
/// access already holding that same object never blocks: the action is
/// deferred to the owner's next safe point, or for an unbound object, to
/// the moment the outer access returns. [`sync`](Self::sync) cannot be
/// deferred and panics in that situation instead of deadlocking.
pub struct Acquirable<T> {
    shared: Arc<Shared<T>>,
}

// Compile-time assertion: handles can cross threads whenever T can.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Acquirable<Vec<u8>>>();
    assert::<OwnerBinding>();
};

impl<T> Clone for Acquirable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Acquirable<T> {
    /// Wrap `value` in an unbound handle.
    pub fn new(value: T) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                value: Mutex::new(value),
                binding: RwLock::new(None),
                queue_tx,
                queue_rx,
            }),
        }
    }

    /// Run `action` against the object, respecting ownership.
    ///
    /// On the owning worker (or when unbound) the action runs now and
    /// [`Access::Immediate`] is returned. On any other thread the action
    /// is queued on the object and [`Access::Deferred`] is returned
    /// without blocking; it runs exactly once, at the owner's next safe
    /// point. Actions deferred from one thread run in the order they were
    /// enqueued. See the type docs for calls made while the object is
    /// already held.
    pub fn with_safe<F>(&self, action: F) -> Access
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let reentrant = is_held_here(self.shared.addr());
        let binding = self.read_binding();
        match binding.as_ref() {
            Some(owner) if reentrant || !owner.is_current_owner() => {
                // Queued under the read lock: rebinding takes the write
                // lock, so it cannot slip between our check and the notice.
                self.queue(Box::new(action));
                owner.notify(Arc::clone(&self.shared) as Arc<dyn PendingActions>);
                Access::Deferred
            }
            Some(owner) => {
                let stats = Arc::clone(owner.stats());
                drop(binding);
                self.shared.hold(Some(&stats), action);
                Access::Immediate
            }
            None if reentrant => {
                drop(binding);
                self.queue(Box::new(action));
                Access::Deferred
            }
            None => {
                drop(binding);
                self.shared.hold(None, action);
                Access::Immediate
            }
        }
    }

    /// Blocking access from any thread.
    ///
    /// Waits for the value's lock even when called off the owning worker;
    /// time spent waiting is charged to the acquisition counter. Prefer
    /// [`with_safe`](Self::with_safe) from inside a tick.
    ///
    /// # Panics
    ///
    /// If the calling thread is already inside an access to this object.
    pub fn sync<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        assert!(
            !is_held_here(self.shared.addr()),
            "Acquirable::sync called on an object this thread already holds"
        );
        let stats = self.read_binding().as_ref().map(|b| Arc::clone(b.stats()));
        self.shared.hold(stats.as_deref(), f)
    }

    fn queue(&self, action: Action<T>) {
        // Both ends live in `shared`, so the channel cannot be disconnected.
        let _ = self.shared.queue_tx.send(action);
    }
}

impl<T> Acquirable<T> {
    fn read_binding(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<OwnerBinding>>> {
        self.shared
            .binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The partition currently owning this object, if bound.
    pub fn partition(&self) -> Option<PartitionKey> {
        self.read_binding().as_ref().map(|b| b.key())
    }

    /// The worker currently owning this object, if bound.
    pub fn owner(&self) -> Option<WorkerId> {
        self.read_binding().as_ref().map(|b| b.owner())
    }

    /// Whether the calling thread is the owning worker.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.read_binding()
            .as_ref()
            .is_some_and(|b| b.is_current_owner())
    }

    /// Whether two handles refer to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Replace the binding, returning the previous one.
    ///
    /// Orchestrator only, between ticks. Callers drain the object's
    /// queue (see [`rebind`]).
    pub(crate) fn bind(&self, binding: Option<Arc<OwnerBinding>>) -> Option<Arc<OwnerBinding>> {
        let mut slot = self
            .shared
            .binding
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, binding)
    }

    /// Actions queued on this object and not yet run.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.shared.queue_rx.len()
    }
}

impl<T> fmt::Debug for Acquirable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquirable")
            .field("partition", &self.partition())
            .finish_non_exhaustive()
    }
}

/// Move `handle` to `binding`, first running the actions still queued on
/// it under its previous partition so none is stranded or run twice.
///
/// Only this object's actions run; others queued on the previous
/// partition stay there for its owner. Returns the number of drained
/// actions. Only called on the orchestrator while no worker is running.
pub(crate) fn rebind<T: Send + 'static>(
    handle: &Acquirable<T>,
    binding: Option<Arc<OwnerBinding>>,
    sink: &dyn ErrorSink,
) -> usize {
    let previous = handle.bind(binding.clone());
    match (previous, binding) {
        (Some(old), Some(new)) if Arc::ptr_eq(&old, &new) => 0,
        (Some(old), _) => handle.shared.run_queued(old.key(), old.stats(), sink),
        (None, _) => 0,
    }
}
