//! Queue worker: claim CRM events, run their handlers, record the outcome.

use super::Relay;
use tracing::{debug, error, info, warn};
use zaprelay_core::{error::RelayError, model::QueueStatus};

impl Relay {
    /// Process up to `limit` queued CRM events, oldest first.
    ///
    /// `preferred` is tried before the rest (the entry a webhook just
    /// enqueued). Each entry is claimed atomically before its handler runs;
    /// an entry another worker claimed first is skipped. A failing entry
    /// never stops the batch. Returns how many entries were claimed.
    pub async fn process_batch(
        &self,
        limit: usize,
        preferred: Option<&str>,
    ) -> Result<usize, RelayError> {
        let lease = self.queue_config.claim_lease_secs;
        let limit = limit.max(1);

        let expired = self.store.expire_exhausted_claims(lease).await?;
        if expired > 0 {
            warn!("queue: {expired} abandoned claim(s) out of attempts, marked failed");
        }

        let mut ids = self.store.claimable_events(limit, lease).await?;
        if let Some(first) = preferred {
            ids.retain(|id| id != first);
            ids.insert(0, first.to_string());
            ids.truncate(limit);
        }

        let mut processed = 0;
        for id in ids {
            match self.store.claim_event(&id, lease).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("queue: {id} not claimable, skipped");
                    continue;
                }
                Err(e) => {
                    error!("queue: claim of {id} failed: {e}");
                    continue;
                }
            }
            processed += 1;
            self.run_entry(&id).await;
        }

        if processed > 0 {
            info!("queue: processed {processed} event(s)");
        }
        Ok(processed)
    }

    /// Run one claimed entry and record done / retry / failed.
    async fn run_entry(&self, id: &str) {
        let result = match self.store.get_event(id).await {
            Ok(entry) => {
                debug!(
                    "queue: {id} {} attempt {}/{}",
                    entry.event_type, entry.attempts, entry.max_attempts
                );
                self.handle_crm_event(&entry).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.store.complete_event(id).await {
                    error!("queue: could not complete {id}: {e}");
                }
            }
            Err(handler_err) => match self.store.fail_event(id, &handler_err.to_string()).await {
                Ok(QueueStatus::Failed) => {
                    error!("queue: {id} failed permanently: {handler_err}");
                }
                Ok(_) => warn!("queue: {id} failed, will retry: {handler_err}"),
                Err(e) => error!("queue: could not record failure of {id}: {e}"),
            },
        }
    }
}
