//! Task Log Module
//!
//! Durable, strictly ordered, append-only storage of pending tasks. There is one
//! logical log per destination class: the web-farm broadcast log and one outbound
//! log per staging server.
//!
//! ## Submodules
//! - **`task_log`**: The log itself: append, per-destination cursors, status updates,
//!   group cancellation, dead letters and compaction.
//! - **`journal`**: The durability boundary. Once `append` returns, the task is in
//!   the journal and survives a restart.
//! - **`types`**: Delivery status, dead letters and journal records.

pub mod journal;
pub mod task_log;
pub mod types;
