//! Testing infrastructure
//!
//! Built-in scenario scripts shared by the CLI, integration tests and
//! benchmarks.

pub mod scenarios;

pub use scenarios::*;
