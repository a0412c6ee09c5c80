use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::discovery::browser::ResolutionCache;
use crate::registry::ServiceRegistry;

/// Periodically evict services that stopped announcing without a goodbye.
///
/// Evicted instances are also dropped from the resolution cache so their next
/// announcement registers them again as new services.
pub async fn run_sweeper(
    registry: Arc<ServiceRegistry>,
    resolutions: Arc<ResolutionCache>,
    stale_after: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for name in registry.evict_stale(stale_after) {
                    resolutions.forget_instance(&name);
                    tracing::info!(instance = %name, "Evicted stale service");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Sweeper shutting down");
                break;
            }
        }
    }
}
