//! Configuration
//!
//! Harness configuration, native code-table presets, shared types and
//! load-time validation of configs and scripts.

pub mod config;
pub mod presets;
pub mod types;
pub mod validator;
