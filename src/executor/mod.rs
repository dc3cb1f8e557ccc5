//! Local Task Executor Module
//!
//! The receiving half of propagation. A peer posts an encoded task envelope; the
//! executor looks up the handler registered for the task type and applies it.
//!
//! ## Submodules
//! - **`registry`**: Maps task types (e.g. "clear-cache") to async handlers.
//! - **`executor`**: Loop prevention, staleness, apply hooks, timeout-bounded handler run.
//! - **`farm`**: Built-in cache and session handlers for web-farm nodes.
//! - **`staging`**: Built-in last-writer-wins object handlers for staging targets.
//! - **`handlers`** / **`protocol`**: The HTTP receive surface.

pub mod executor;
pub mod farm;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod staging;
