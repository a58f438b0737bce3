//! Test utilities and mock collaborators for Tessera development.
//!
//! Provides an [`ErrorSink`] that records what it receives
//! ([`CollectingSink`]), a hand-driven [`Clock`] ([`ManualClock`]), and the
//! domain fixtures in [`fixtures`].

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tessera_core::{Clock, EngineError, ErrorSink, UnitKind};

pub use fixtures::{BarrierProbe, CountingUnit, TestDomain, TestInstance};

/// Records every error it is handed.
#[derive(Debug, Default)]
pub struct CollectingSink {
    errors: Mutex<Vec<EngineError>>,
    panic_next: AtomicBool,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the first error, then panics in the caller. Used to kill a
    /// worker thread from outside the isolation boundary.
    pub fn panicking_once() -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            panic_next: AtomicBool::new(true),
        }
    }

    pub fn errors(&self) -> Vec<EngineError> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The units of every [`EngineError::UnitFailed`], in arrival order.
    pub fn unit_failures(&self) -> Vec<UnitKind> {
        self.errors()
            .iter()
            .filter_map(EngineError::failed_unit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorSink for CollectingSink {
    fn handle(&self, error: &EngineError) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.clone());
        if self.panic_next.swap(false, Ordering::AcqRel) {
            panic!("collecting sink asked to panic on {error}");
        }
    }
}

/// [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_nanos),
        }
    }

    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}
