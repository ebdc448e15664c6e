//! Fixed-tick delivery loop, one task per destination.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::Aggregator;

/// Drive rate-limited send attempts for one aggregator until shutdown.
///
/// A slow send delays the next tick rather than stacking attempts; missed
/// ticks are skipped.
pub async fn run_delivery_loop(
    aggregator: Arc<Aggregator>,
    tick: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX);
    info!(destination = %aggregator.name(), tick_ms, "delivery loop started");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if aggregator.try_send_one(true).await {
                    debug!(destination = %aggregator.name(), "fragment delivered");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!(destination = %aggregator.name(), "delivery loop shutting down");
                    break;
                }
            }
        }
    }

    info!(destination = %aggregator.name(), "delivery loop stopped");
}
