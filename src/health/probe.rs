//! Periodic liveness probing of destinations.
//!
//! Unreachable destinations receive no deliveries, so a probe is the only way for
//! them to become healthy again. Healthy destinations are probed too, which lets a
//! dead peer be noticed before the next task is due.

use super::tracker::HealthTracker;
use super::types::Destination;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, destination: &Destination) -> anyhow::Result<()>;
}

/// Probes every non-disabled destination once and feeds the tracker.
pub async fn probe_all(tracker: &HealthTracker, prober: &dyn Prober) {
    for destination in tracker.probe_targets() {
        let result = prober
            .probe(&destination)
            .await
            .map_err(|e| e.to_string());
        if let Err(e) = &result {
            tracing::debug!("Probe of '{}' failed: {}", destination.name, e);
        }
        tracker.report_probe(&destination.name, result);
    }
}

/// Spawns the probe loop. Abort the returned handle to stop it.
pub fn spawn_probe_loop(
    tracker: Arc<HealthTracker>,
    prober: Arc<dyn Prober>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Starting destination probe loop (every {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            probe_all(&tracker, prober.as_ref()).await;
        }
    })
}
