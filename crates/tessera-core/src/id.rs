//! Strongly-typed identifiers and the [`TickStart`] stamp.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing tick counter.
///
/// `TickId(0)` means "no tick has run yet"; the first executed tick is 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickId(pub u64);

impl TickId {
    /// The tick following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TickId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Index of a worker thread in the dispatcher pool (`0..N`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// The worker index as a `usize`, for slice indexing.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Counter for unique [`InstanceId`] allocation.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies a world instance (a dimension / map hosted by the server).
///
/// Allocated from a process-wide monotonic counter via
/// [`InstanceId::next`], so two registries never hand out the same ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Allocate a fresh, unique instance ID. Thread-safe.
    pub fn next() -> Self {
        Self(INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Identifies an entity. Chosen by the domain, unique per server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity-{}", self.0)
    }
}

impl From<u32> for EntityId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Chunk column coordinates within one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    /// Chunk X coordinate.
    pub x: i32,
    /// Chunk Z coordinate.
    pub z: i32,
}

impl ChunkPos {
    /// Construct a chunk position.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The chunk containing the given block coordinates (16-block chunks).
    pub fn containing(block_x: i32, block_z: i32) -> Self {
        Self {
            x: block_x >> 4,
            z: block_z >> 4,
        }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Spatial key of a partition: one chunk of one instance.
///
/// A partition is always wholly owned by exactly one worker; the key is
/// what the dispatcher's arena is indexed by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// The instance the chunk belongs to.
    pub instance: InstanceId,
    /// The chunk position within the instance.
    pub chunk: ChunkPos,
}

impl PartitionKey {
    /// Construct a partition key.
    pub fn new(instance: InstanceId, chunk: ChunkPos) -> Self {
        Self { instance, chunk }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance, self.chunk)
    }
}

/// Identity and start time of the tick being executed.
///
/// Passed by value to every domain callback. `nanos` is the monotonic
/// timestamp supplied to `Ticker::tick`, not wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickStart {
    /// Sequence number of this tick.
    pub tick: TickId,
    /// Monotonic nanoseconds at which the tick started.
    pub nanos: u64,
}

impl TickStart {
    /// Construct a tick stamp.
    pub fn new(tick: TickId, nanos: u64) -> Self {
        Self { tick, nanos }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_id_next_is_monotonic() {
        let t = TickId::default();
        assert_eq!(t, TickId(0));
        assert_eq!(t.next(), TickId(1));
        assert!(t.next().next() > t.next());
    }

    #[test]
    fn instance_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn chunk_containing_handles_negative_blocks() {
        assert_eq!(ChunkPos::containing(0, 0), ChunkPos::new(0, 0));
        assert_eq!(ChunkPos::containing(15, 31), ChunkPos::new(0, 1));
        assert_eq!(ChunkPos::containing(-1, -16), ChunkPos::new(-1, -1));
        assert_eq!(ChunkPos::containing(-17, 16), ChunkPos::new(-2, 1));
    }

    #[test]
    fn partition_key_display() {
        let inst = InstanceId::next();
        let key = PartitionKey::new(inst, ChunkPos::new(3, -2));
        assert_eq!(key.to_string(), format!("instance-{}@(3, -2)", inst.get()));
    }
}
