//! Bounded command execution.
//!
//! Commands are spawned directly from an argument vector, never through
//! `/bin/sh`, so user-supplied addresses and names cannot inject shell
//! syntax. Every call carries a timeout; a child that overruns it is killed.
//!
//! # Example
//!
//! ```ignore
//! use netsim_common::shell::{self, DOCKER_CMD};
//! use std::time::Duration;
//!
//! let argv = [DOCKER_CMD, "network", "ls", "--format", "{{.Name}}"];
//! let result = shell::exec(&argv, Duration::from_secs(10)).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{CmdError, CmdResult};

/// Name of the `docker` CLI, resolved through `PATH`.
pub const DOCKER_CMD: &str = "docker";

/// Name of the `ip` command inside node containers.
pub const IP_CMD: &str = "ip";

/// Name of the `ping` command inside node containers.
pub const PING_CMD: &str = "ping";

/// Characters that need escaping in shell double-quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Characters that never need quoting.
static SHELL_SAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_./:=@%+,{}-]+$").expect("Invalid regex pattern"));

/// Quotes a string for display as part of a shell command line.
///
/// Plain words are returned as-is; anything else is wrapped in double
/// quotes with `$`, `` ` ``, `"`, `\` and newline escaped.
///
/// ```
/// use netsim_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "simple");
/// assert_eq!(shellquote("with space"), "\"with space\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    if !s.is_empty() && SHELL_SAFE_RE.is_match(s) {
        return s.to_string();
    }
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Renders an argument vector as a copy-pasteable command line.
pub fn render<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| shellquote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The trimmed stdout output.
    pub stdout: String,
    /// The trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Builds a result from its parts.
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs a command and waits at most `timeout` for it to finish.
///
/// A non-zero exit status is not an error here; inspect
/// [`ExecResult::success`]. Spawn failures and timeouts are.
pub async fn exec<S: AsRef<str>>(argv: &[S], timeout: Duration) -> CmdResult<ExecResult> {
    let (program, args) = argv.split_first().ok_or(CmdError::EmptyCommand)?;
    let command = render(argv);
    tracing::debug!(command = %command, timeout_secs = timeout.as_secs_f64(), "Executing command");

    let child = Command::new(program.as_ref())
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CmdError::Spawn {
                command,
                source: e,
            })
        }
        Err(_) => {
            tracing::warn!(command = %command, "Command timed out");
            return Err(CmdError::Timeout { command, timeout });
        }
    };

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %command, "Command succeeded");
    } else {
        tracing::debug!(
            command = %command,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command exited non-zero"
        );
    }

    Ok(result)
}

/// Runs a command and turns a non-zero exit into [`CmdError::Failed`].
///
/// Returns stdout on success.
pub async fn exec_or_throw<S: AsRef<str>>(argv: &[S], timeout: Duration) -> CmdResult<String> {
    let result = exec(argv, timeout).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(CmdError::Failed {
            command: render(argv),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
