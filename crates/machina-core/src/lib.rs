//! Execution engine for Machina workflows.
//!
//! This crate owns the executor, the expression and template layers, the
//! execution strategies, and the storage traits ("ports") that
//! `machina-infra` implements. It depends on `machina-types` and never on
//! `machina-infra` or any database crate.

pub mod invoke;
pub mod machine;
pub mod store;
