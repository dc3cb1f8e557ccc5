//! Health Module Tests
//!
//! ## Test Scopes
//! - **Transitions**: Failure threshold, probe recovery, administrative disable/enable.
//! - **Eligibility**: What the dispatcher is told for each state and disabled policy.
//! - **Events**: Transitions are observable on the broadcast channel.
//! - **Probing**: `probe_all` feeds probe results into the tracker.

#[cfg(test)]
mod tests {
    use crate::health::probe::{Prober, probe_all};
    use crate::health::tracker::HealthTracker;
    use crate::health::types::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn tracker_with(names: &[&str], threshold: u32) -> HealthTracker {
        let tracker = HealthTracker::new(threshold, DisabledPolicy::Retain);
        for name in names {
            tracker.register(Destination::farm_node(*name, format!("http://{}", name)));
        }
        tracker
    }

    // ============================================================
    // TEST 1: Transitions
    // ============================================================

    #[test]
    fn test_new_destination_is_healthy() {
        let tracker = tracker_with(&["d1"], 3);
        assert_eq!(tracker.state("d1"), Some(HealthState::Healthy));
        assert_eq!(tracker.eligibility("d1"), Eligibility::Deliver);
    }

    #[test]
    fn test_unreachable_after_exactly_threshold_failures() {
        let tracker = tracker_with(&["d1"], 3);

        tracker.report_failure("d1", "connection refused");
        tracker.report_failure("d1", "connection refused");
        assert_eq!(tracker.state("d1"), Some(HealthState::Healthy));

        tracker.report_failure("d1", "connection refused");
        assert_eq!(tracker.state("d1"), Some(HealthState::Unreachable));
        assert_eq!(tracker.eligibility("d1"), Eligibility::Hold);

        let health = tracker.health("d1").unwrap();
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let tracker = tracker_with(&["d1"], 3);

        tracker.report_failure("d1", "timeout");
        tracker.report_failure("d1", "timeout");
        tracker.report_success("d1");
        tracker.report_failure("d1", "timeout");
        tracker.report_failure("d1", "timeout");

        assert_eq!(tracker.state("d1"), Some(HealthState::Healthy));
    }

    #[test]
    fn test_probe_recovers_unreachable_destination() {
        let tracker = tracker_with(&["d1"], 2);
        tracker.report_failure("d1", "down");
        tracker.report_failure("d1", "down");
        assert_eq!(tracker.state("d1"), Some(HealthState::Unreachable));

        tracker.report_probe("d1", Ok(()));

        assert_eq!(tracker.state("d1"), Some(HealthState::Healthy));
        assert_eq!(tracker.health("d1").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_failed_probe_makes_healthy_destination_unreachable() {
        let tracker = tracker_with(&["d1"], 5);

        tracker.report_probe("d1", Err("no route to host".to_string()));

        assert_eq!(tracker.state("d1"), Some(HealthState::Unreachable));
    }

    #[test]
    fn test_successful_delivery_recovers_unreachable() {
        let tracker = tracker_with(&["d1"], 1);
        tracker.report_failure("d1", "down");
        assert_eq!(tracker.state("d1"), Some(HealthState::Unreachable));

        tracker.report_success("d1");
        assert_eq!(tracker.state("d1"), Some(HealthState::Healthy));
    }

    #[test]
    fn test_disabled_is_terminal_until_enabled() {
        let tracker = tracker_with(&["d1"], 1);

        assert!(tracker.disable("d1"));
        tracker.report_probe("d1", Ok(()));
        tracker.report_success("d1");
        tracker.report_failure("d1", "ignored");
        assert_eq!(tracker.state("d1"), Some(HealthState::Disabled));
        assert_eq!(tracker.eligibility("d1"), Eligibility::Hold);
        assert!(tracker.probe_targets().is_empty());

        assert!(tracker.enable("d1"));
        assert_eq!(tracker.state("d1"), Some(HealthState::Healthy));
    }

    #[test]
    fn test_enable_does_not_override_unreachable() {
        let tracker = tracker_with(&["d1"], 1);
        tracker.report_failure("d1", "down");

        assert!(tracker.enable("d1"));
        assert_eq!(tracker.state("d1"), Some(HealthState::Unreachable));
    }

    #[test]
    fn test_drop_policy_for_disabled_destination() {
        let tracker = HealthTracker::new(3, DisabledPolicy::Drop);
        tracker.register(Destination::staging_target("prod", "http://prod"));
        tracker.disable("prod");

        assert_eq!(tracker.eligibility("prod"), Eligibility::Drop);
    }

    #[test]
    fn test_unknown_destination_is_held_and_reports_ignored() {
        let tracker = tracker_with(&[], 1);
        tracker.report_failure("ghost", "x");
        assert_eq!(tracker.eligibility("ghost"), Eligibility::Hold);
        assert!(!tracker.disable("ghost"));
    }

    #[test]
    fn test_register_keeps_state_and_updates_details() {
        let tracker = tracker_with(&["d1"], 1);
        tracker.report_failure("d1", "down");

        tracker.register(Destination::farm_node("d1", "http://new-address"));

        let health = tracker.health("d1").unwrap();
        assert_eq!(health.state, HealthState::Unreachable);
        assert_eq!(health.destination.url, "http://new-address");
    }

    #[test]
    fn test_concurrent_reports_count_every_failure() {
        let tracker = Arc::new(tracker_with(&["d1"], 1_000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.report_failure("d1", "x");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.health("d1").unwrap().consecutive_failures, 800);
    }

    // ============================================================
    // TEST 2: Events
    // ============================================================

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let tracker = tracker_with(&["d1"], 1);
        let mut events = tracker.subscribe();

        tracker.report_failure("d1", "down");
        tracker.report_probe("d1", Ok(()));
        tracker.disable("d1");

        let first = events.recv().await.unwrap();
        assert_eq!(first.destination, "d1");
        assert_eq!(first.from, HealthState::Healthy);
        assert_eq!(first.to, HealthState::Unreachable);

        let second = events.recv().await.unwrap();
        assert_eq!(second.to, HealthState::Healthy);

        let third = events.recv().await.unwrap();
        assert_eq!(third.to, HealthState::Disabled);
    }

    #[tokio::test]
    async fn test_no_event_without_state_change() {
        let tracker = tracker_with(&["d1"], 3);
        let mut events = tracker.subscribe();

        tracker.report_success("d1");
        tracker.report_failure("d1", "x");

        assert!(events.try_recv().is_err());
    }

    // ============================================================
    // TEST 3: Probing
    // ============================================================

    struct FixedProber {
        down: HashSet<String>,
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, destination: &Destination) -> anyhow::Result<()> {
            if self.down.contains(&destination.name) {
                anyhow::bail!("{} is down", destination.name);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_probe_all_updates_every_destination() {
        let tracker = tracker_with(&["up", "down", "recovering"], 1);
        tracker.report_failure("recovering", "earlier outage");

        let prober = FixedProber {
            down: HashSet::from(["down".to_string()]),
        };
        probe_all(&tracker, &prober).await;

        assert_eq!(tracker.state("up"), Some(HealthState::Healthy));
        assert_eq!(tracker.state("down"), Some(HealthState::Unreachable));
        assert_eq!(tracker.state("recovering"), Some(HealthState::Healthy));
    }
}
