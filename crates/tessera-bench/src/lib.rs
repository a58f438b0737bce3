//! Benchmark profiles and utilities for the Tessera tick engine.
//!
//! Provides a small synthetic domain ([`BenchDomain`]) and pre-built
//! world profiles for benchmarks and examples:
//!
//! - [`Profile::reference`]: 16x16 chunks, 4 mobs per chunk
//! - [`Profile::stress`]: 48x48 chunks, 8 mobs per chunk
//! - [`populate`]: registers a profile's instance, chunks and mobs on a ticker

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use tessera_core::{
    ChunkPos, Domain, EngineError, EntityId, ErrorSink, InstanceId, InstanceTick, PartitionKey, TickStart, Tickable,
    UpdateError,
};
use tessera_engine::{Acquirable, DispatchError, Ticker};

/// Per-partition chunk doing a fixed amount of busy work per tick.
#[derive(Debug, Default)]
pub struct Cell {
    /// Bumped by mobs in neighbouring partitions.
    pub heat: u64,
    /// Rolling hash of all work done so far.
    pub digest: u64,
    work: u32,
}

impl Cell {
    /// A cell mixing `work` rounds per tick.
    pub fn new(work: u32) -> Self {
        Self {
            heat: 0,
            digest: 0,
            work,
        }
    }
}

impl Tickable for Cell {
    fn update(&mut self, tick: TickStart) -> Result<(), UpdateError> {
        let mut x = self.digest ^ tick.tick.0;
        for _ in 0..self.work {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        }
        self.digest = x;
        Ok(())
    }
}

/// Entity that warms the chunk next to its own once per tick.
#[derive(Debug)]
pub struct Mob {
    /// Ticks this mob has taken.
    pub steps: u64,
    neighbour: Option<Acquirable<Cell>>,
}

impl Mob {
    /// A mob acting on `neighbour` every tick, if set.
    pub fn new(neighbour: Option<Acquirable<Cell>>) -> Self {
        Self { steps: 0, neighbour }
    }
}

impl Tickable for Mob {
    fn update(&mut self, _tick: TickStart) -> Result<(), UpdateError> {
        self.steps += 1;
        if let Some(cell) = &self.neighbour {
            cell.with_safe(|c| c.heat += 1);
        }
        Ok(())
    }
}

/// World instance counting its ticks.
#[derive(Debug, Default)]
pub struct Region {
    /// Ticks seen.
    pub ticks: u64,
}

impl InstanceTick for Region {
    fn tick(&mut self, _tick: TickStart) -> Result<(), UpdateError> {
        self.ticks += 1;
        Ok(())
    }
}

/// [`Domain`] of [`Region`], [`Cell`] and [`Mob`].
#[derive(Debug)]
pub struct BenchDomain;

impl Domain for BenchDomain {
    type Instance = Region;
    type Chunk = Cell;
    type Entity = Mob;
}

/// Shape of a benchmark world.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Profile {
    /// Chunks per side of the square grid.
    pub side: i32,
    /// Mobs per chunk.
    pub mobs_per_chunk: u32,
    /// Mixing rounds per chunk update.
    pub work: u32,
    /// Whether mobs poke the chunk to their east, crossing partitions.
    pub cross_partition: bool,
}

impl Profile {
    /// 16x16 chunks (256 partitions), 4 mobs per chunk.
    pub fn reference() -> Self {
        Self {
            side: 16,
            mobs_per_chunk: 4,
            work: 256,
            cross_partition: true,
        }
    }

    /// 48x48 chunks (2304 partitions), 8 mobs per chunk.
    pub fn stress() -> Self {
        Self {
            side: 48,
            mobs_per_chunk: 8,
            work: 256,
            cross_partition: true,
        }
    }

    /// Number of partitions this profile creates.
    pub fn partitions(&self) -> usize {
        (self.side.max(0) as usize).pow(2)
    }

    /// Number of entities this profile creates.
    pub fn entities(&self) -> usize {
        self.partitions() * self.mobs_per_chunk as usize
    }
}

/// Handles to everything [`populate`] registered.
#[derive(Debug)]
pub struct World {
    /// The instance owning every partition.
    pub instance: InstanceId,
    /// Chunk handles in row-major order.
    pub cells: Vec<Acquirable<Cell>>,
    /// Mob handles in creation order.
    pub mobs: Vec<Acquirable<Mob>>,
}

/// Register one [`Region`] and the chunks and mobs of `profile` on
/// `ticker`. Everything is live from the next tick.
pub fn populate(ticker: &mut Ticker<BenchDomain>, profile: &Profile) -> Result<World, DispatchError> {
    let instance = ticker.add_instance(Region::default());
    let d = ticker.dispatcher_mut();
    let side = profile.side.max(0);

    let mut cells = Vec::with_capacity(profile.partitions());
    for z in 0..side {
        for x in 0..side {
            let key = PartitionKey::new(instance, ChunkPos::new(x, z));
            cells.push(d.create_partition(key, Cell::new(profile.work))?);
        }
    }

    let mut mobs = Vec::with_capacity(profile.entities());
    let mut next_id = 0u32;
    for z in 0..side {
        for x in 0..side {
            let key = PartitionKey::new(instance, ChunkPos::new(x, z));
            let east = (z * side + (x + 1) % side) as usize;
            for _ in 0..profile.mobs_per_chunk {
                let neighbour = profile.cross_partition.then(|| cells[east].clone());
                next_id += 1;
                mobs.push(d.add_entity(EntityId(next_id), Mob::new(neighbour), key)?);
            }
        }
    }

    Ok(World {
        instance,
        cells,
        mobs,
    })
}

/// An [`ErrorSink`] that discards everything.
pub fn quiet_sink() -> Arc<dyn ErrorSink> {
    Arc::new(|_: &EngineError| {})
}
