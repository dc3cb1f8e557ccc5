//! Sync Service Module
//!
//! Orchestration of one node: the producer entry point, destination and group
//! administration, and the background dispatchers and loops.
//!
//! ## Submodules
//! - **`service`**: `SyncService`, wiring policies, hooks, logs, tracker and transport.
//! - **`handlers`** / **`protocol`**: The HTTP producer and admin surface, and the node router.

pub mod handlers;
pub mod protocol;
pub mod service;

#[cfg(test)]
mod tests;
