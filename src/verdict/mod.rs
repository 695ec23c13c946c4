//! Classification and verdict
//!
//! Native results are classified as pure functions of the raw signal, the
//! observations fold into a validation record, and the run verdict is derived
//! from the collected evidence.

pub mod classifier;
pub mod record;
pub mod verdict;
