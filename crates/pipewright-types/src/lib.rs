//! Shared domain types for Pipewright.
//!
//! Workflow definitions, run and step records, engine configuration, and the
//! repository error type shared by the core ports and their implementations.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod workflow;
