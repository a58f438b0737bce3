//! Default error sink.

use tessera_core::{EngineError, ErrorSink};

/// [`ErrorSink`] that logs every engine error through `tracing`.
///
/// Unit failures and lost workers log at `error`, barrier stalls at
/// `warn`. Never blocks beyond the installed subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingSink;

impl ErrorSink for LoggingSink {
    fn handle(&self, error: &EngineError) {
        match error {
            EngineError::UnitFailed { unit, source } => {
                tracing::error!(%unit, error = %source, "unit failed");
            }
            EngineError::WorkerLost { worker, tick } => {
                tracing::error!(%worker, %tick, "worker lost");
            }
            EngineError::BarrierStalled { .. } => {
                tracing::warn!("{error}");
            }
        }
    }
}
