use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::services::context::TenantContext;
use crate::services::lifecycle::{Job, LifecycleManager, SweepReport};
use crate::services::metrics::refresh_tenant_gauges;

/// Spawn the background task that drives provisioning and deletion.
///
/// Queued jobs are handled as they arrive; on every tick the registry is swept
/// for tenants whose retry backoff or deletion grace period has elapsed, so
/// work survives restarts even though the queue itself is in memory.
pub fn start(
    manager: LifecycleManager,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(TenantContext::detached(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Lifecycle worker started (sweep every {}s)", interval.as_secs());

        loop {
            tokio::select! {
                Some(job) = jobs.recv() => manager.handle(job).await,
                _ = ticker.tick() => {
                    match manager.sweep(Utc::now()).await {
                        Ok(report) if report != SweepReport::default() => {
                            info!("Lifecycle sweep: {report:?}");
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Lifecycle sweep failed: {e}"),
                    }
                    refresh_tenant_gauges(manager.registry()).await;
                }
            }
        }
    }))
}
