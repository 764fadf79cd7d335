//! Workflow engine core: definition parsing, DAG scheduling, and execution.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save/discovery
//! - `dag` -- dependency graph, topological layers, readiness queries
//! - `template` -- `{{<step-id>.result}}` prompt rendering
//! - `engine` -- wave-based executor with cancellation and resume

pub mod dag;
pub mod definition;
pub mod engine;
pub mod template;

#[cfg(test)]
pub(crate) mod test_support;
