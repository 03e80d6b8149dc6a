use crate::coordinator::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Triggers a refresh every `every`. The first tick is skipped, setup has
/// already refreshed. A slow cycle delays the next tick instead of bursting.
pub fn spawn_refresh_loop(coordinator: Arc<Coordinator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            // failures are already logged and published by the coordinator
            if let Err(e) = coordinator.request_refresh().await {
                debug!(error = %e, "scheduled refresh failed");
            }
        }
    })
}
