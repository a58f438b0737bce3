//! Error types for the Tessera tick engine.
//!
//! Organized by who produces them: domain callbacks return
//! [`UpdateError`]; the engine wraps those (and its own liveness
//! diagnostics) into [`EngineError`] and hands them to the error sink.
//! Per-unit failures never propagate as `Err` past the dispatcher or
//! ticker boundary.

use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

use crate::id::{EntityId, InstanceId, PartitionKey, TickId, WorkerId};

/// Failure of a single domain callback.
///
/// Returned by [`Tickable::update`](crate::Tickable::update) and friends.
/// Panics inside callbacks are caught by the engine and converted into
/// [`UpdateError::Panicked`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// The callback reported a failure.
    #[error("execution failed: {reason}")]
    ExecutionFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// The callback panicked; the panic was caught at the unit boundary.
    #[error("panicked: {message}")]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },
}

impl UpdateError {
    /// Shorthand for [`UpdateError::ExecutionFailed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            reason: reason.into(),
        }
    }
}

/// The smallest isolated unit of work that can fail during a tick.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// A world instance's `tick` callback (world-update phase).
    Instance(InstanceId),
    /// A partition's chunk `update` callback (dispatcher phase).
    Partition(PartitionKey),
    /// An entity's `update` callback inside a partition.
    Entity {
        /// The failing entity.
        entity: EntityId,
        /// The partition that owned it during the tick.
        partition: PartitionKey,
    },
    /// A deferred acquirable action drained at a partition's safe point.
    Deferred(PartitionKey),
    /// A scheduled task.
    ScheduledTask(u64),
    /// An intake handler (inbound work) by name.
    Intake(String),
    /// A flush target (outbound side effects) by name.
    Flush(String),
    /// A tick observer.
    Observer,
    /// A job submitted to the orchestrator from another thread.
    Job,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(id) => write!(f, "{id}"),
            Self::Partition(key) => write!(f, "partition {key}"),
            Self::Entity { entity, partition } => write!(f, "{entity} in partition {partition}"),
            Self::Deferred(key) => write!(f, "deferred action on partition {key}"),
            Self::ScheduledTask(id) => write!(f, "scheduled task #{id}"),
            Self::Intake(name) => write!(f, "intake '{name}'"),
            Self::Flush(name) => write!(f, "flush '{name}'"),
            Self::Observer => write!(f, "tick observer"),
            Self::Job => write!(f, "orchestrator job"),
        }
    }
}

/// An error delivered to the [`ErrorSink`](crate::ErrorSink).
///
/// None of these abort a tick: sibling units always run to completion.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A per-unit callback failed or panicked.
    #[error("{unit} failed: {source}")]
    UnitFailed {
        /// Which unit failed.
        unit: UnitKind,
        /// The underlying callback error.
        source: UpdateError,
    },
    /// A worker thread died mid-tick and did not reach the barrier.
    #[error("{worker} lost during tick {tick}")]
    WorkerLost {
        /// The dead worker's slot.
        worker: WorkerId,
        /// The tick during which it disappeared.
        tick: TickId,
    },
    /// The barrier has been waiting longer than the stall warning period.
    #[error("tick {tick} barrier stalled for {waited_ms}ms on {} worker(s)", .workers.len())]
    BarrierStalled {
        /// The tick whose barrier is stalled.
        tick: TickId,
        /// How long the barrier had been waiting when reported.
        waited_ms: u64,
        /// Workers that had not reported completion.
        workers: SmallVec<[WorkerId; 4]>,
    },
}

impl EngineError {
    /// Shorthand for [`EngineError::UnitFailed`].
    pub fn unit(unit: UnitKind, source: UpdateError) -> Self {
        Self::UnitFailed { unit, source }
    }

    /// The failing unit, if this is a per-unit failure.
    pub fn failed_unit(&self) -> Option<&UnitKind> {
        match self {
            Self::UnitFailed { unit, .. } => Some(unit),
            _ => None,
        }
    }
}
