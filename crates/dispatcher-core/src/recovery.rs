//! Startup and periodic reclaim of jobs orphaned by a previous (or stuck)
//! process.
//!
//! Grounded in the "babysitter" shape used elsewhere for Postgres-backed job
//! queues: a best-effort sweep that tolerates the store being briefly
//! unavailable and simply retries on the next tick rather than treating that
//! as fatal.

use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Run the startup reclaim pass once, before the listener loop begins
/// admitting work. Running this twice in a row with nothing newly stale is a
/// no-op: the second call simply finds no rows to reclaim.
#[instrument(skip(store), fields(generation = %generation))]
pub async fn reclaim_on_startup(
    store: &dyn JobStore,
    stale_threshold_secs: i64,
    generation: Uuid,
) -> anyhow::Result<Vec<Uuid>> {
    let reclaimed = store
        .reclaim_stale(stale_threshold_secs, generation)
        .await?;
    if reclaimed.is_empty() {
        info!("recovery: no orphaned jobs found");
    } else {
        info!(count = reclaimed.len(), "recovery: reclaimed orphaned jobs");
    }
    Ok(reclaimed)
}

/// Spawn the periodic background sweep that catches jobs a worker silently
/// died on without writing a terminal status. Runs on a longer cadence than
/// the listener loop; exits when `shutdown` fires.
pub fn spawn_periodic_reclaim(
    store: Arc<dyn JobStore>,
    interval: Duration,
    stale_threshold_secs: i64,
    generation: Uuid,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(err) = reclaim_on_startup(store.as_ref(), stale_threshold_secs, generation).await
            {
                error!(error = %err, "periodic reclaim sweep failed, will retry next tick");
            }
        }
    })
}
