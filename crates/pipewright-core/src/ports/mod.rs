//! Collaborator ports consumed by the workflow engine.
//!
//! - `AgentRunner`: executes a rendered prompt and returns the agent's text
//! - `ChannelSender`: delivers a message to a channel target
//!
//! Each port is an RPITIT trait with an object-safe `*Dyn` companion and a
//! `Box*` wrapper so concrete implementations can be chosen at runtime.

pub mod agent;
pub mod channel;
