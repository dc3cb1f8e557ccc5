//! Event Hooks Module
//!
//! Before/after extension points that let other subsystems veto, augment or observe
//! task logging and local application without the core depending on them.

pub mod registry;
