//! Optional background queue poller for `serve`.

use super::Relay;
use std::sync::Arc;
use tracing::{error, info};

/// Invoke the worker every `interval_secs`. Runs until the process exits.
pub(super) async fn poll_loop(relay: Arc<Relay>, interval_secs: u64) {
    info!("queue poller: every {interval_secs}s");
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;

        let batch = relay.queue_config.batch_size;
        if let Err(e) = relay.process_batch(batch, None).await {
            error!("queue poller: worker pass failed: {e}");
        }
    }
}
