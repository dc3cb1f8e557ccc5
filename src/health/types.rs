use serde::{Deserialize, Serialize};

/// What kind of peer a destination is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    /// Another node of the same web farm (cache/session invalidation).
    FarmNode,
    /// A separate environment that applies content changes to its own store.
    StagingTarget,
}

/// One peer that receives tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub display_name: String,
    pub kind: DestinationKind,
    /// Base URL of the peer's sync endpoint (e.g. `http://10.0.0.5:6000`).
    pub url: String,
}

impl Destination {
    pub fn farm_node(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            kind: DestinationKind::FarmNode,
            url: url.into(),
        }
    }

    pub fn staging_target(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            kind: DestinationKind::StagingTarget,
            url: url.into(),
        }
    }
}

/// Health of a destination as seen by this node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Too many consecutive failures or a failed probe. Tasks stay queued.
    Unreachable,
    /// Switched off by an administrator until re-enabled.
    Disabled,
}

/// What to do with tasks for a disabled destination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisabledPolicy {
    /// Keep tasks queued until the destination is enabled again.
    #[default]
    Retain,
    /// Mark tasks dead as they reach the head of the log.
    Drop,
}

/// The dispatcher's answer to "may I deliver to this destination now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Deliver,
    /// Skip for now, keep tasks queued.
    Hold,
    /// Skip and drop tasks.
    Drop,
}

/// Health bookkeeping for one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationHealth {
    pub destination: Destination,
    pub state: HealthState,
    pub consecutive_failures: u32,
    /// Timestamp (ms) of the last state transition.
    pub since: u64,
    pub last_error: Option<String>,
}

/// Emitted on every state transition, for operator notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthEvent {
    pub destination: String,
    pub from: HealthState,
    pub to: HealthState,
    pub reason: String,
    pub at: u64,
}
