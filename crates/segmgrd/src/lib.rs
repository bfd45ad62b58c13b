//! Segment manager for simulated network nodes
//!
//! Reconciles the interfaces and static routes of simulated hosts and
//! routers onto container networks. Every distinct IPv4 subnet in the
//! topology maps to one container network ("segment"); a node interface is
//! an attachment of the node's container to that segment with a fixed IP.

mod address;
mod commands;
mod config;
mod conflict;
mod error;
mod locks;
mod node;
mod provider;
mod reconciler;
mod registry;
mod routes;
mod seg_mgr;
mod state;
mod tables;
mod types;

pub use address::*;
pub use commands::*;
pub use config::*;
pub use conflict::{check_interface, check_route, ConflictError};
pub use error::{SegMgrError, SegMgrResult};
pub use locks::KeyedLocks;
pub use node::PingReport;
pub use provider::*;
pub use reconciler::ReconcileStep;
pub use registry::{ConsistencyError, Observation, SegmentRegistry};
pub use seg_mgr::{ReconcileReport, SegMgr, SegMgrOptions};
pub use state::*;
pub use tables::*;
pub use types::*;
