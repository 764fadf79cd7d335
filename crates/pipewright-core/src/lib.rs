//! Workflow engine and port definitions for Pipewright.
//!
//! This crate defines the "ports" (store, agent and channel traits) that the
//! infrastructure layer and host applications implement. It depends only on
//! `pipewright-types` -- never on `pipewright-infra` or any database crate.

pub mod ports;
pub mod repository;
pub mod workflow;
