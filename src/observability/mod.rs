//! Observability
//!
//! Structured audit events and metrics for operational visibility. Neither
//! feeds back into a run's outcome.

pub mod audit;
pub mod metrics;
