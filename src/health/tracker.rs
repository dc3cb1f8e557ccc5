//! Target Health Tracker
//!
//! Per-destination state machine fed by dispatch outcomes and periodic probes:
//!
//! ```text
//! Healthy --(N consecutive failures | failed probe)--> Unreachable
//! Unreachable --(successful probe | successful delivery)--> Healthy
//! any --(disable)--> Disabled --(enable)--> Healthy
//! ```
//!
//! State lives in a `DashMap`, so every update holds the destination's shard lock
//! for its whole read-modify-write. Several dispatchers (one per log) may report on
//! the same destination concurrently.

use super::types::*;
use crate::task::types::now_ms;

use dashmap::DashMap;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct HealthTracker {
    destinations: DashMap<String, DestinationHealth>,
    failure_threshold: u32,
    disabled_policy: DisabledPolicy,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, disabled_policy: DisabledPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            destinations: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            disabled_policy,
            events,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Starts tracking a destination as `Healthy`. Re-registering keeps the
    /// current state but refreshes the destination details.
    pub fn register(&self, destination: Destination) {
        match self.destinations.get_mut(&destination.name) {
            Some(mut existing) => existing.destination = destination,
            None => {
                tracing::info!("Tracking health of destination '{}'", destination.name);
                self.destinations.insert(
                    destination.name.clone(),
                    DestinationHealth {
                        destination,
                        state: HealthState::Healthy,
                        consecutive_failures: 0,
                        since: now_ms(),
                        last_error: None,
                    },
                );
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<DestinationHealth> {
        self.destinations.remove(name).map(|(_, health)| health)
    }

    pub fn state(&self, name: &str) -> Option<HealthState> {
        self.destinations.get(name).map(|entry| entry.state)
    }

    pub fn health(&self, name: &str) -> Option<DestinationHealth> {
        self.destinations.get(name).map(|entry| entry.clone())
    }

    pub fn snapshot(&self) -> Vec<DestinationHealth> {
        let mut all: Vec<DestinationHealth> = self
            .destinations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.destination.name.cmp(&b.destination.name));
        all
    }

    /// Destinations that should be probed (everything not disabled).
    pub fn probe_targets(&self) -> Vec<Destination> {
        self.destinations
            .iter()
            .filter(|entry| entry.state != HealthState::Disabled)
            .map(|entry| entry.destination.clone())
            .collect()
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn eligibility(&self, name: &str) -> Eligibility {
        match self.state(name) {
            Some(HealthState::Healthy) => Eligibility::Deliver,
            Some(HealthState::Unreachable) | None => Eligibility::Hold,
            Some(HealthState::Disabled) => match self.disabled_policy {
                DisabledPolicy::Retain => Eligibility::Hold,
                DisabledPolicy::Drop => Eligibility::Drop,
            },
        }
    }

    pub fn report_success(&self, name: &str) {
        self.transition(name, |health| {
            health.consecutive_failures = 0;
            health.last_error = None;
            match health.state {
                HealthState::Unreachable => Some((HealthState::Healthy, "delivery succeeded")),
                _ => None,
            }
        });
    }

    pub fn report_failure(&self, name: &str, error: &str) {
        let threshold = self.failure_threshold;
        self.transition(name, |health| {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_error = Some(error.to_string());
            match health.state {
                HealthState::Healthy if health.consecutive_failures >= threshold => Some((
                    HealthState::Unreachable,
                    "consecutive delivery failures reached threshold",
                )),
                _ => None,
            }
        });
    }

    /// Feeds the outcome of a liveness probe.
    pub fn report_probe(&self, name: &str, result: Result<(), String>) {
        match result {
            Ok(()) => self.transition(name, |health| {
                match health.state {
                    HealthState::Unreachable => {
                        health.consecutive_failures = 0;
                        health.last_error = None;
                        Some((HealthState::Healthy, "probe succeeded"))
                    }
                    _ => None,
                }
            }),
            Err(error) => self.transition(name, |health| {
                health.last_error = Some(error.clone());
                match health.state {
                    HealthState::Healthy => Some((HealthState::Unreachable, "probe failed")),
                    _ => None,
                }
            }),
        }
    }

    /// Administrator action. Disabled stays disabled until [`enable`](Self::enable).
    pub fn disable(&self, name: &str) -> bool {
        self.admin_transition(name, HealthState::Disabled, "disabled by administrator")
    }

    pub fn enable(&self, name: &str) -> bool {
        self.admin_transition(name, HealthState::Healthy, "enabled by administrator")
    }

    fn admin_transition(&self, name: &str, to: HealthState, reason: &str) -> bool {
        let event = {
            let Some(mut health) = self.destinations.get_mut(name) else {
                return false;
            };
            let from = health.state;
            if from == to {
                return true;
            }
            if to == HealthState::Healthy && from != HealthState::Disabled {
                // enable() only lifts an administrative disable
                return true;
            }
            health.state = to;
            health.consecutive_failures = 0;
            health.since = now_ms();
            HealthEvent {
                destination: name.to_string(),
                from,
                to,
                reason: reason.to_string(),
                at: health.since,
            }
        };
        self.publish(event);
        true
    }

    /// Runs `update` under the destination's lock. Reports for disabled or unknown
    /// destinations are ignored.
    fn transition<F>(&self, name: &str, update: F)
    where
        F: FnOnce(&mut DestinationHealth) -> Option<(HealthState, &'static str)>,
    {
        let event = {
            let Some(mut health) = self.destinations.get_mut(name) else {
                tracing::trace!("Health report for unknown destination '{}'", name);
                return;
            };
            if health.state == HealthState::Disabled {
                return;
            }

            let from = health.state;
            let Some((to, reason)) = update(health.value_mut()) else {
                return;
            };
            health.state = to;
            health.since = now_ms();
            HealthEvent {
                destination: name.to_string(),
                from,
                to,
                reason: reason.to_string(),
                at: health.since,
            }
        };
        self.publish(event);
    }

    fn publish(&self, event: HealthEvent) {
        match event.to {
            HealthState::Healthy => tracing::info!(
                "Destination '{}' is healthy again ({})",
                event.destination,
                event.reason
            ),
            HealthState::Unreachable => tracing::warn!(
                "Destination '{}' is unreachable ({})",
                event.destination,
                event.reason
            ),
            HealthState::Disabled => {
                tracing::info!("Destination '{}' disabled", event.destination)
            }
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
