//! Observability setup for Machina: tracing subscriber installation with
//! optional OpenTelemetry export.

pub mod tracing_setup;

pub use tracing_setup::{init_test_tracing, init_tracing, shutdown_tracing};
