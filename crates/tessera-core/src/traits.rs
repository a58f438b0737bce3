//! Collaborator traits implemented by domain code and by the embedder.

use crate::error::{EngineError, UpdateError};
use crate::id::TickStart;

/// Something that is updated once per tick by the worker owning it.
///
/// Chunks and entities implement this. The engine guarantees that
/// `update` is only ever called from the worker thread currently owning
/// the enclosing partition, and never concurrently with itself.
pub trait Tickable: Send + 'static {
    /// Advance this object by one tick.
    fn update(&mut self, tick: TickStart) -> Result<(), UpdateError>;
}

/// Per-instance update callback, run on the orchestrating thread during
/// the world-update phase.
pub trait InstanceTick: Send + 'static {
    /// Advance instance-wide state (time of day, weather, ...) by one tick.
    fn tick(&mut self, tick: TickStart) -> Result<(), UpdateError>;
}

/// Bundles the three domain types the engine is generic over.
///
/// Selecting concrete types happens once, at the type level, so the
/// engine never inspects runtime types to pick a callback.
pub trait Domain: Send + 'static {
    /// A world instance.
    type Instance: InstanceTick;
    /// Per-partition chunk data.
    type Chunk: Tickable;
    /// An entity living inside a partition.
    type Entity: Tickable;
}

/// Receives every per-unit failure and liveness diagnostic.
///
/// Called from worker threads and from the orchestrator. Implementations
/// must not panic and must not block materially: a slow sink slows the
/// barrier down.
pub trait ErrorSink: Send + Sync {
    /// Handle one engine error.
    fn handle(&self, error: &EngineError);
}

impl<F> ErrorSink for F
where
    F: Fn(&EngineError) + Send + Sync,
{
    fn handle(&self, error: &EngineError) {
        self(error)
    }
}

/// Monotonic nanosecond time source used for tick duration measurement.
pub trait Clock: Send + Sync {
    /// Nanoseconds since an arbitrary, fixed, process-local origin.
    fn nanos(&self) -> u64;
}
