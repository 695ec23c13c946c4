//! Safety and cleanup
//!
//! Exactly-once release of owned handles and run-scoped workspace files.

pub mod cleanup;
pub mod workspace;
