//! Execution control
//!
//! Drives scripted runs through the five phases with type-state ordering and
//! bounded native calls.

pub mod executor;
pub mod phase;
pub mod watchdog;
