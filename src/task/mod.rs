//! Task Model
//!
//! The immutable record describing one unit of change, plus its wire format.
//!
//! ## Submodules
//! - **`types`**: `Task`, `TaskDraft`, the structured `TaskPayload`, task groups and ids.
//! - **`codec`**: Versioned binary encoding of tasks as they travel between nodes.

pub mod codec;
pub mod types;

#[cfg(test)]
mod tests;
