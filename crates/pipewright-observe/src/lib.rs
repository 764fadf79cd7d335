//! Observability setup for Pipewright: tracing subscriber installation and
//! optional OpenTelemetry export.

pub mod tracing_setup;
