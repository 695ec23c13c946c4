//! Library-agnostic harness core.
//!
//! Core owns the vocabulary shared by every component: handle identity,
//! scalar values, raw native signals, the script model and the capability
//! interface target libraries implement.

pub mod library;
pub mod script;
pub mod types;
