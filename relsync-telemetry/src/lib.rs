//! Telemetry initialization for relsync services and tests.

pub mod tracing;
