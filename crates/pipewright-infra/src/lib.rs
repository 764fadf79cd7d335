//! Infrastructure layer for Pipewright.
//!
//! Contains implementations of the ports defined in `pipewright-core`: the
//! SQLite run-state store and its connection pool, plus the `config.toml`
//! loader.

pub mod config;
pub mod sqlite;
