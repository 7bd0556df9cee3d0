//! Infrastructure layer for Machina.
//!
//! Contains implementations of the storage traits defined in `machina-core`:
//! filesystem and SQLite checkpoint stores, result channels and execution
//! locks, plus engine configuration loading and the backend factory.

pub mod backend;
pub mod config;
pub mod filesystem;
pub mod sqlite;

pub use backend::Backends;
