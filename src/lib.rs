//! seqbox: an API-sequence exerciser for native libraries
//!
//! Runs scripted call sequences against a target library through five
//! ordered phases, tracks who owns every handle the library hands out,
//! classifies every native return, and releases whatever the script left
//! behind exactly once.
//!
//! # Architecture
//!
//! ## Core ([`core`])
//! - [`core::types`]: handle identity, scalar values, raw native signals
//! - [`core::script`]: the operation and script model (JSON or builders)
//! - [`core::library`]: the capability interface target libraries implement
//!
//! ## Ownership ([`ownership`])
//! - [`ownership::graph`]: handle graph with owners and non-owning references
//! - [`ownership::tracker`]: validated, journaled ownership transitions
//!
//! ## Execution Control ([`exec`])
//! - [`exec::phase`]: type-state enforced phase ordering
//! - [`exec::executor`]: the phase executor and run reports
//! - [`exec::watchdog`]: bounded execution of blocking native calls
//!
//! ## Evidence & Verdict ([`verdict`])
//! - [`verdict::classifier`]: raw signal to `ErrorKind`, per library code table
//! - [`verdict::record`]: ordered record and folded checksum aggregation
//! - [`verdict::verdict`]: run outcome from collected evidence
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::cleanup`]: leaves-first teardown with canonical destructors
//! - [`safety::workspace`]: run-scoped scratch files
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: JSON-lines audit events
//! - [`observability::metrics`]: counters, gauges, histograms, Prometheus export
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: harness configuration loading
//! - [`config::validator`]: config and script validation
//! - [`config::types`]: error taxonomy, phases, outcomes
//! - [`config::presets`]: versioned native code tables
//!
//! ## Targets ([`targets`])
//! - [`targets::json_tree`]: JSON tree library model
//! - [`targets::zstream`]: zlib stream and gzip file model
//! - [`targets::registry`]: lookup by library name
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::scenarios`]: built-in scenario scripts

// Core vocabulary and script model
pub mod core;

// Ownership tracking
pub mod ownership;

// Execution Control
pub mod exec;

// Evidence & Verdict
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Target libraries
pub mod targets;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the seqbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use crate::config::types::*;
pub use crate::core::script::{Effect, ErrorContract, Operation, Predicate, Script};
pub use crate::exec::executor::{CancelToken, PhaseExecutor, RunReport};
