//! Best-effort side effects: run, and on failure log and record, never propagate.

use super::Relay;
use std::future::Future;
use tracing::warn;
use zaprelay_core::error::RelayError;

impl Relay {
    /// Run a side effect whose failure must not fail the triggering request.
    ///
    /// Returns the value on success, `None` on failure (after recording it).
    pub(super) async fn best_effort<T, F>(&self, kind: &str, reference: &str, effect: F) -> Option<T>
    where
        F: Future<Output = Result<T, RelayError>>,
    {
        match effect.await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{kind} [{reference}] failed: {e}");
                if let Err(log_err) = self.failures.record(kind, reference, &e.to_string()).await {
                    warn!("could not record {kind} failure: {log_err}");
                }
                None
            }
        }
    }
}
