//! Tessera: a partition-based concurrent tick engine.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the Tessera sub-crates. For most users, adding `tessera` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera::prelude::*;
//!
//! // A chunk that counts how often it has grown.
//! struct Plot {
//!     grown: u32,
//! }
//!
//! impl Tickable for Plot {
//!     fn update(&mut self, _tick: TickStart) -> Result<(), UpdateError> {
//!         self.grown += 1;
//!         Ok(())
//!     }
//! }
//!
//! struct Overworld;
//!
//! impl InstanceTick for Overworld {
//!     fn tick(&mut self, _tick: TickStart) -> Result<(), UpdateError> {
//!         Ok(())
//!     }
//! }
//!
//! struct Farm;
//!
//! impl Domain for Farm {
//!     type Instance = Overworld;
//!     type Chunk = Plot;
//!     type Entity = Plot;
//! }
//!
//! let config = EngineConfig {
//!     worker_count: Some(2),
//!     ..EngineConfig::default()
//! };
//! let server: Server<Farm> = Server::new(config, Arc::new(LoggingSink)).unwrap();
//! let plot = server
//!     .execute(|ticker| {
//!         let world = ticker.add_instance(Overworld);
//!         let key = PartitionKey::new(world, ChunkPos::new(0, 0));
//!         ticker.dispatcher_mut().create_partition(key, Plot { grown: 0 }).unwrap()
//!     })
//!     .unwrap();
//!
//! server.start().unwrap();
//! for n in 1..=3u64 {
//!     server.tick(n * 50_000_000).unwrap();
//! }
//! assert_eq!(plot.sync(|p| p.grown), 3);
//! assert!(server.stop().is_some());
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `tessera-core` | IDs, error taxonomy, domain traits |
//! | [`engine`] | `tessera-engine` | Dispatcher, acquirables, ticker, server, snapshots |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and IDs (`tessera-core`).
///
/// Contains the typed identifiers, [`types::EngineError`] and the traits
/// domain code implements ([`types::Tickable`], [`types::InstanceTick`],
/// [`types::Domain`]).
pub use tessera_core as types;

/// The tick engine (`tessera-engine`).
///
/// [`engine::Server`] for a managed lifecycle with optional fixed-rate
/// ticking, [`engine::Ticker`] and [`engine::ThreadDispatcher`] for
/// embedding the tick loop directly.
pub use tessera_engine as engine;

/// Common imports for typical Tessera usage.
///
/// ```rust
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    // Identifiers
    pub use tessera_core::{ChunkPos, EntityId, InstanceId, PartitionKey, TickId, TickStart, WorkerId};

    // Traits implemented by domain code
    pub use tessera_core::{Domain, ErrorSink, InstanceTick, Tickable};

    // Errors
    pub use tessera_core::{EngineError, UnitKind, UpdateError};

    // Engine
    pub use tessera_engine::{
        Access, Acquirable, EngineConfig, LoggingSink, Server, ServerError, ShutdownReport, ThreadDispatcher,
        TickMonitor, Ticker,
    };

    // Scheduling and I/O phases
    pub use tessera_engine::{inbox, outbound, Schedule, SchedulePhase};

    // Snapshots
    pub use tessera_engine::{CapturingUpdater, ServerSnapshot, SnapshotUpdater};
}
