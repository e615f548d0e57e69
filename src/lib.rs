//! Chute deployment agent: turns chute updates into images, containers,
//! bridge networks and network interfaces plumbed into container namespaces.

pub mod config;
pub mod containers;
pub mod context;
pub mod error;
pub mod image;
pub mod interfaces;
pub mod netns;
pub mod pipeline;
pub mod ports;
pub mod resources;
pub mod runtime;
pub mod types;
pub mod update;

#[cfg(test)]
mod testing;

pub use context::AgentContext;
pub use error::{Error, Result};
