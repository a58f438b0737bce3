//! Bounded inbound queues drained once per tick.
//!
//! An inbox pairs a cloneable [`InboxSender`] (any thread, any time) with
//! an [`Inbox`] registered on the ticker. During the intake phase the
//! inbox hands up to `max_per_tick` queued items to its
//! [`IntakeHandler`], in submission order; the rest wait for the next
//! tick. A full queue rejects submissions instead of blocking the
//! producer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tessera_core::{ErrorSink, TickStart, UnitKind, UpdateError};

use crate::isolate::run_isolated;

/// Processes one inbound item on the orchestrator.
pub trait IntakeHandler<T>: Send + 'static {
    /// Handle `item` during the intake phase of `tick`.
    fn handle(&mut self, item: T, tick: TickStart) -> Result<(), UpdateError>;
}

impl<T, F> IntakeHandler<T> for F
where
    F: FnMut(T, TickStart) -> Result<(), UpdateError> + Send + 'static,
{
    fn handle(&mut self, item: T, tick: TickStart) -> Result<(), UpdateError> {
        self(item, tick)
    }
}

/// Error submitting to an inbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The inbox is at capacity (back-pressure).
    #[error("inbox is full")]
    Full,
    /// The inbox was dropped.
    #[error("inbox is closed")]
    Closed,
}

/// Create an inbox named `name` holding at most `capacity` queued items
/// and handing at most `max_per_tick` of them to `handler` per tick.
///
/// `capacity` and `max_per_tick` are raised to at least 1.
pub fn inbox<T, H>(name: impl Into<String>, capacity: usize, max_per_tick: usize, handler: H) -> (InboxSender<T>, Inbox)
where
    T: Send + 'static,
    H: IntakeHandler<T>,
{
    let name: Arc<str> = Arc::from(name.into());
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let rejected = Arc::new(AtomicU64::new(0));
    let sender = InboxSender {
        name: Arc::clone(&name),
        tx,
        rejected: Arc::clone(&rejected),
    };
    let inbox = Inbox {
        name,
        rejected,
        stage: Box::new(Stage {
            rx,
            handler,
            max_per_tick: max_per_tick.max(1),
        }),
    };
    (sender, inbox)
}

/// Producer side of an inbox. Cheap to clone.
pub struct InboxSender<T> {
    name: Arc<str>,
    tx: Sender<T>,
    rejected: Arc<AtomicU64>,
}

impl<T> Clone for InboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            rejected: Arc::clone(&self.rejected),
        }
    }
}

impl<T> fmt::Debug for InboxSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboxSender")
            .field("name", &self.name)
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl<T> InboxSender<T> {
    /// Queue an item without blocking.
    pub fn try_submit(&self, item: T) -> Result<(), SubmitError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Closed),
        }
    }

    /// Number of submissions rejected because the inbox was full.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// The inbox name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

trait Drain: Send {
    fn drain(&mut self, name: &Arc<str>, tick: TickStart, sink: &dyn ErrorSink) -> usize;
    fn pending(&self) -> usize;
}

struct Stage<T, H> {
    rx: Receiver<T>,
    handler: H,
    max_per_tick: usize,
}

impl<T, H> Drain for Stage<T, H>
where
    T: Send + 'static,
    H: IntakeHandler<T>,
{
    fn drain(&mut self, name: &Arc<str>, tick: TickStart, sink: &dyn ErrorSink) -> usize {
        let mut handled = 0;
        while handled < self.max_per_tick {
            let Ok(item) = self.rx.try_recv() else {
                break;
            };
            run_isolated(
                sink,
                || UnitKind::Intake(name.to_string()),
                || self.handler.handle(item, tick),
            );
            handled += 1;
        }
        handled
    }

    fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Consumer side of an inbox, registered on the ticker.
pub struct Inbox {
    name: Arc<str>,
    rejected: Arc<AtomicU64>,
    stage: Box<dyn Drain>,
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Inbox {
    /// The inbox name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Items waiting for a future intake phase.
    pub fn pending(&self) -> usize {
        self.stage.pending()
    }

    /// Submissions rejected because the inbox was full.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Hand up to `max_per_tick` items to the handler, each isolated.
    /// Returns how many items were handled.
    pub fn drain(&mut self, tick: TickStart, sink: &dyn ErrorSink) -> usize {
        self.stage.drain(&self.name, tick, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tessera_core::TickId;
    use tessera_test_utils::CollectingSink;

    fn at(n: u64) -> TickStart {
        TickStart::new(TickId(n), 0)
    }

    #[test]
    fn capacity_applies_back_pressure() {
        let (tx, inbox) = inbox("chat", 2, 10, |_: u32, _: TickStart| -> Result<(), UpdateError> { Ok(()) });
        assert_eq!(tx.try_submit(1), Ok(()));
        assert_eq!(tx.try_submit(2), Ok(()));
        assert_eq!(tx.try_submit(3), Err(SubmitError::Full));
        assert_eq!(tx.rejected(), 1);
        assert_eq!(inbox.rejected(), 1);
        assert_eq!(inbox.pending(), 2);
    }

    #[test]
    fn per_tick_limit_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let (tx, mut inbox) = inbox("moves", 16, 3, move |item: u32, tick: TickStart| -> Result<(), UpdateError> {
            log.lock().unwrap().push((tick.tick.0, item));
            Ok(())
        });
        for i in 0..5 {
            tx.try_submit(i).unwrap();
        }
        let sink = CollectingSink::new();
        assert_eq!(inbox.drain(at(1), &sink), 3);
        assert_eq!(inbox.drain(at(2), &sink), 2);
        assert_eq!(inbox.drain(at(3), &sink), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, 0), (1, 1), (1, 2), (2, 3), (2, 4)]
        );
    }

    #[test]
    fn failing_item_is_isolated() {
        let (tx, mut inbox) = inbox("login", 8, 8, |item: u32, _: TickStart| -> Result<(), UpdateError> {
            if item == 1 {
                Err(UpdateError::failed("bad login"))
            } else {
                Ok(())
            }
        });
        for i in 0..3 {
            tx.try_submit(i).unwrap();
        }
        let sink = CollectingSink::new();
        assert_eq!(inbox.drain(at(1), &sink), 3);
        assert_eq!(sink.unit_failures(), vec![UnitKind::Intake("login".into())]);
    }

    #[test]
    fn dropped_inbox_closes_sender() {
        let (tx, inbox) = inbox("gone", 1, 1, |_: u8, _: TickStart| -> Result<(), UpdateError> { Ok(()) });
        drop(inbox);
        assert_eq!(tx.try_submit(0), Err(SubmitError::Closed));
    }
}
