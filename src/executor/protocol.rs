//! Receive-side Protocol Definitions
//!
//! Endpoints a node exposes to its peers, and the JSON bodies it answers with.
//! Task envelopes themselves travel in the binary wire format of
//! [`crate::task::codec`].

use super::executor::ApplyOutcome;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_APPLY: &str = "/internal/sync/apply";
pub const ENDPOINT_HEALTH: &str = "/internal/sync/health";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyResponse {
    pub outcome: Option<ApplyOutcome>,
    pub error: Option<String>,
}

impl ApplyResponse {
    pub fn ok(outcome: ApplyOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub node: String,
    pub handlers: Vec<String>,
}
