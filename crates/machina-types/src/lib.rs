//! Shared domain types for Machina.
//!
//! Workflow definitions, machine snapshots, engine configuration, and the
//! storage error type. Zero infrastructure dependencies -- only serde,
//! chrono, thiserror.

pub mod config;
pub mod error;
pub mod machine;
pub mod snapshot;
