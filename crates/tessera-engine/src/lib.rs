//! Partition-based concurrent tick engine.
//!
//! The world is split into partitions (a chunk plus the entities inside
//! it). A fixed pool of worker threads owns them; the [`ThreadDispatcher`]
//! runs one parallel update across all partitions per tick behind a hard
//! barrier. Cross-partition mutation goes through [`Acquirable`], which
//! runs an action immediately on the owning worker and defers it to the
//! owner's next safe point everywhere else. The [`Ticker`] sequences the
//! phases of a tick on a single orchestrating thread, and [`Server`] adds
//! a lifecycle and an optional fixed-rate tick thread.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod acquirable;
pub mod assigner;
pub mod clock;
pub mod config;
pub mod dispatcher;
mod driver;
pub mod flush;
pub mod intake;
mod isolate;
pub mod lifecycle;
pub mod metrics;
mod partition;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod snapshot;
pub mod ticker;
mod worker;

pub use acquirable::{Access, Acquirable};
pub use assigner::{AssignmentPolicy, LeastLoaded, Migration, PartitionAssigner, PartitionLoad, RoundRobin, WorkerLoad};
pub use clock::{monotonic_nanos, MonotonicClock};
pub use config::{AssignmentStrategy, ConfigError, EngineConfig, RebalanceConfig};
pub use dispatcher::{DispatchError, DispatchStats, DispatcherHandle, RefreshStats, ThreadDispatcher};
pub use flush::{outbound, Flush, OutboundBuffer, OutboundWriter};
pub use intake::{inbox, Inbox, InboxSender, IntakeHandler, SubmitError};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use metrics::{TickMetrics, TickMonitor};
pub use scheduler::{Schedule, SchedulePhase, Scheduler, SchedulerHandle, TaskId};
pub use server::{Server, ServerError, ShutdownReport};
pub use sink::LoggingSink;
pub use snapshot::{CapturingUpdater, ServerSnapshot, SnapshotCoordinator, SnapshotRef, SnapshotUpdater};
pub use ticker::{TickObserver, Ticker};
