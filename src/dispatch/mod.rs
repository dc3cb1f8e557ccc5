//! Dispatch Module
//!
//! One dispatcher per (task log, destination) drains the log in order through a
//! [`transport::Transport`], gated by the destination's health.

pub mod dispatcher;
pub mod transport;
