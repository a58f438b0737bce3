//! Core types and traits for the Tessera tick engine.
//!
//! This is the leaf crate with no internal dependencies. It defines the
//! vocabulary shared by every other crate in the workspace: typed IDs,
//! the error taxonomy handed to error sinks, and the collaborator traits
//! that domain code implements (chunks, entities, world instances).

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod id;
pub mod traits;

pub use error::{EngineError, UnitKind, UpdateError};
pub use id::{ChunkPos, EntityId, InstanceId, PartitionKey, TickId, TickStart, WorkerId};
pub use traits::{Clock, Domain, ErrorSink, InstanceTick, Tickable};
