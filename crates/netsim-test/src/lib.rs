//! Integration test infrastructure for the segment manager
//!
//! Provides:
//! - An in-memory simulation environment backed by `MockProvider`
//! - Scenario fixtures for hosts, routers and routes
//! - Topology and command verification helpers

mod environment;
pub mod fixtures;
mod verification;

pub use environment::SimEnv;
pub use fixtures::*;
pub use verification::*;
