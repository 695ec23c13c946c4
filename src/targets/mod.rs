//! Target libraries.
//!
//! The harness core stays library-agnostic. Each target models a native
//! library's handle families behind the [`TargetLibrary`](crate::core::library::TargetLibrary)
//! trait.

pub mod json_tree;
pub mod registry;
pub mod zstream;
