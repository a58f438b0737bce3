//! Failure isolation at the unit boundary.
//!
//! Every domain callback runs through [`run_isolated`]: an `Err` return
//! or a panic becomes one [`EngineError::UnitFailed`] sent to the sink,
//! and control returns normally to the caller so sibling units proceed.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tessera_core::{EngineError, ErrorSink, UnitKind, UpdateError};

/// Run `f`, converting failure into a sink notification.
///
/// `unit` is only evaluated on failure. Returns `true` if `f` succeeded.
pub(crate) fn run_isolated<F, U>(sink: &dyn ErrorSink, unit: U, f: F) -> bool
where
    F: FnOnce() -> Result<(), UpdateError>,
    U: FnOnce() -> UnitKind,
{
    match catch(f) {
        Ok(()) => true,
        Err(source) => {
            sink.handle(&EngineError::unit(unit(), source));
            false
        }
    }
}

/// Run `f`, folding a panic into [`UpdateError::Panicked`].
pub(crate) fn catch<F>(f: F) -> Result<(), UpdateError>
where
    F: FnOnce() -> Result<(), UpdateError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(UpdateError::Panicked {
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<EngineError>>);

    impl ErrorSink for Collect {
        fn handle(&self, error: &EngineError) {
            self.0.lock().unwrap().push(error.clone());
        }
    }

    #[test]
    fn success_reports_nothing() {
        let sink = Collect::default();
        assert!(run_isolated(&sink, || UnitKind::Observer, || Ok(())));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn err_is_forwarded_with_unit() {
        let sink = Collect::default();
        let ok = run_isolated(&sink, || UnitKind::Job, || Err(UpdateError::failed("nope")));
        assert!(!ok);
        let errors = sink.0.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0],
            EngineError::unit(UnitKind::Job, UpdateError::failed("nope"))
        );
    }

    #[test]
    fn panic_is_caught_and_message_kept() {
        let sink = Collect::default();
        let ok = run_isolated(&sink, || UnitKind::Observer, || panic!("kaboom {}", 7));
        assert!(!ok);
        let errors = sink.0.lock().unwrap();
        match &errors[0] {
            EngineError::UnitFailed {
                source: UpdateError::Panicked { message },
                ..
            } => assert_eq!(message, "kaboom 7"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
