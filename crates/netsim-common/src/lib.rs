//! Common infrastructure for netsim daemons.
//!
//! - [`shell`]: argv-based command execution with bounded timeouts
//! - [`error`]: error types for command execution
//! - [`logging`]: tracing subscriber setup
//!
//! # Example
//!
//! ```ignore
//! use netsim_common::shell::{self, DOCKER_CMD};
//! use std::time::Duration;
//!
//! async fn remove_network(name: &str) -> netsim_common::CmdResult<()> {
//!     shell::exec_or_throw(&[DOCKER_CMD, "network", "rm", name], Duration::from_secs(20)).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod shell;

pub use error::{CmdError, CmdResult};
pub use logging::init_logging;
pub use shell::ExecResult;
