//! Target Health Module
//!
//! Tracks whether each destination may currently receive deliveries.
//!
//! ## Core Mechanisms
//! - **State machine**: `Healthy` / `Unreachable` / `Disabled`, fed by dispatch outcomes.
//! - **Probing**: A background loop probes destinations so unreachable peers can recover.
//! - **Events**: Every transition is broadcast for operator notification. The tracker
//!   never mutates a task log; it only answers the dispatcher's eligibility check.

pub mod probe;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod tests;
