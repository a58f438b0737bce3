//! Outbound side effects released once per tick.
//!
//! Code running anywhere during a tick (instance callbacks, workers,
//! deferred actions) writes through an [`OutboundWriter`]; nothing leaves
//! the process until the flush phase, when each [`Flush`] target
//! delivers the batch accumulated for that tick.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tessera_core::{TickStart, UpdateError};

/// A target released in the flush phase.
pub trait Flush: Send + 'static {
    /// Name used when reporting failures.
    fn name(&self) -> &str;

    /// Release everything buffered for `tick`. Returns how many items
    /// were delivered.
    fn flush(&mut self, tick: TickStart) -> Result<usize, UpdateError>;
}

/// Delivery callback of an [`OutboundBuffer`].
pub type Deliver<T> = Box<dyn FnMut(Vec<T>, TickStart) -> Result<(), UpdateError> + Send>;

/// Create a named outbound buffer delivering batches through `deliver`.
pub fn outbound<T, F>(name: impl Into<String>, deliver: F) -> (OutboundWriter<T>, OutboundBuffer<T>)
where
    T: Send + 'static,
    F: FnMut(Vec<T>, TickStart) -> Result<(), UpdateError> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    let buffer = OutboundBuffer {
        name: name.into(),
        rx,
        deliver: Box::new(deliver),
        delivered: Arc::new(AtomicU64::new(0)),
    };
    let writer = OutboundWriter {
        tx,
        delivered: Arc::clone(&buffer.delivered),
    };
    (writer, buffer)
}

/// Producer side of an outbound buffer. Cheap to clone, usable from any
/// thread.
pub struct OutboundWriter<T> {
    tx: Sender<T>,
    delivered: Arc<AtomicU64>,
}

impl<T> Clone for OutboundWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            delivered: Arc::clone(&self.delivered),
        }
    }
}

impl<T> fmt::Debug for OutboundWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundWriter")
            .field("buffered", &self.tx.len())
            .finish()
    }
}

impl<T> OutboundWriter<T> {
    /// Buffer an item for the next flush. Returns `false` if the buffer
    /// was dropped.
    pub fn write(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Items delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

/// Consumer side: registered on the ticker as a [`Flush`] target.
pub struct OutboundBuffer<T> {
    name: String,
    rx: Receiver<T>,
    deliver: Deliver<T>,
    delivered: Arc<AtomicU64>,
}

impl<T> fmt::Debug for OutboundBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundBuffer")
            .field("name", &self.name)
            .field("buffered", &self.rx.len())
            .finish()
    }
}

impl<T: Send + 'static> Flush for OutboundBuffer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Delivers what was buffered when the flush began; later writes wait
    /// for the next tick. An empty batch is not delivered.
    fn flush(&mut self, tick: TickStart) -> Result<usize, UpdateError> {
        let queued = self.rx.len();
        if queued == 0 {
            return Ok(0);
        }
        let batch: Vec<T> = self.rx.try_iter().take(queued).collect();
        let n = batch.len();
        (self.deliver)(batch, tick)?;
        self.delivered.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}
