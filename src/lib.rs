//! Farm Sync Library
//!
//! Propagates object changes from the node where they happen to the other nodes of a
//! web farm (cache and session invalidation) and to staging targets (content
//! upserts and deletes). The binary (`main.rs`) wires these modules into a node.
//!
//! ## Architecture Modules
//! - **`task`**: The task model shared by every other module, and its wire codec.
//! - **`policy`**: Logging policies that turn an object change into tasks for named logs.
//! - **`log`**: Durable, ordered task logs with one cursor per subscribed destination.
//! - **`dispatch`**: One dispatcher per (log, destination) delivering tasks in order,
//!   with retries, dead-lettering and pluggable transports.
//! - **`health`**: Destination health tracking, failure thresholds and recovery probes.
//! - **`executor`**: Applies received tasks locally through registered handlers.
//! - **`hooks`**: Before/after extension points around logging and applying tasks.
//! - **`service`**: The node facade tying the above together, plus its HTTP surface.
//! - **`config`**: TOML/environment configuration.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod health;
pub mod hooks;
pub mod log;
pub mod policy;
pub mod service;
pub mod task;
