//! Error types for command execution.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for command execution.
pub type CmdResult<T> = Result<T, CmdError>;

/// Errors that can occur while running an external command.
#[derive(Debug, Error)]
pub enum CmdError {
    /// The argument vector was empty.
    #[error("Empty command line")]
    EmptyCommand,

    /// Failed to spawn the command.
    #[error("Failed to execute command '{command}': {source}")]
    Spawn {
        /// The rendered command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The command did not finish within its time budget.
    #[error("Command timed out after {}s: '{command}'", timeout.as_secs_f64())]
    Timeout {
        /// The rendered command line.
        command: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// Command returned non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    Failed {
        /// The rendered command line.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },
}

impl CmdError {
    /// Returns the rendered command line this error refers to, if any.
    pub fn command(&self) -> Option<&str> {
        match self {
            CmdError::EmptyCommand => None,
            CmdError::Spawn { command, .. }
            | CmdError::Timeout { command, .. }
            | CmdError::Failed { command, .. } => Some(command),
        }
    }

    /// Returns true if the command never produced an exit status.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CmdError::Timeout { .. })
    }
}
