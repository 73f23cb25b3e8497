//! ufleet - fleet membership and capability-based deployment orchestration
//!
//! Nodes join a fleet with single-use encrypted tokens, report liveness
//! through heartbeats, and host services deployed through a uniform target
//! abstraction covering both standalone container-engine nodes and clusters.

pub mod cli;
pub mod config;
pub mod deploy;
pub mod fleet;
pub mod provider;
pub mod server;
