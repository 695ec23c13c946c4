//! Resource ownership tracking
//!
//! Handle graph, ownership states and the journaled tracker that validates
//! every transition before the native call is made.

pub mod graph;
pub mod tracker;

pub use graph::{HandleEntry, Owner};
pub use tracker::{OwnershipTracker, OwnershipViolation, Transition, TransitionAction};
