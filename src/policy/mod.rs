//! Logging Policy Module
//!
//! Turns object changes into task drafts destined for named task logs.

pub mod defaults;
pub mod registry;
