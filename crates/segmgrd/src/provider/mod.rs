//! Container network provider abstraction
//!
//! The segment manager never talks to a container runtime directly. All
//! segment and container operations go through [`NetworkProvider`], which
//! classifies failures so the reconciler can absorb the idempotent ones.

mod docker;
mod mock;

pub use docker::{DockerProvider, ProviderTimeouts};
pub use mock::{FaultPoint, MockProvider, ProviderOp};

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use netsim_common::{CmdError, ExecResult};
use thiserror::Error;

use crate::address::Subnet;
use crate::types::NodeKind;

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Classified provider failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Segment or container already exists
    #[error("{what} already exists")]
    AlreadyExists { what: String },

    /// Segment or container does not exist
    #[error("{what} not found")]
    NotFound { what: String },

    /// Container is not attached to the segment
    #[error("Container {container} is not connected to {segment}")]
    NotConnected { segment: String, container: String },

    /// Requested address is held by another endpoint
    #[error("Address {ip} already in use on {segment}")]
    AddressInUse { segment: String, ip: Ipv4Addr },

    /// Call exceeded its time budget
    #[error("Provider call timed out after {}s: {command}", timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    /// Call failed for an unclassified reason
    #[error("Provider command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Provider binary could not be started
    #[error("Failed to run provider command '{command}': {message}")]
    Spawn { command: String, message: String },

    /// Provider output could not be understood
    #[error("Unexpected provider output: {message}")]
    Parse { message: String },
}

impl ProviderError {
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn not_connected(segment: impl Into<String>, container: impl Into<String>) -> Self {
        Self::NotConnected {
            segment: segment.into(),
            container: container.into(),
        }
    }

    pub fn failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<CmdError> for ProviderError {
    fn from(err: CmdError) -> Self {
        match err {
            CmdError::EmptyCommand => Self::failed("", "empty command line"),
            CmdError::Spawn { command, source } => Self::Spawn {
                command,
                message: source.to_string(),
            },
            CmdError::Timeout { command, timeout } => Self::Timeout { command, timeout },
            CmdError::Failed {
                command, output, ..
            } => Self::CommandFailed {
                command,
                message: output,
            },
        }
    }
}

/// Entry of a segment listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub name: String,

    /// Raw subnet text as reported; `None` for networks without IPAM config
    pub subnet: Option<String>,
}

/// Live view of one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    pub subnet: Option<String>,

    /// Attached containers and their addresses
    pub members: Vec<(String, Ipv4Addr)>,
}

impl SegmentInfo {
    /// Address held by `container`, if attached
    pub fn address_of(&self, container: &str) -> Option<Ipv4Addr> {
        self.members
            .iter()
            .find(|(name, _)| name == container)
            .map(|(_, ip)| *ip)
    }

    /// Container holding `ip`, if any
    pub fn holder_of(&self, ip: Ipv4Addr) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, addr)| *addr == ip)
            .map(|(name, _)| name.as_str())
    }
}

/// Container launch parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name, equal to the node id
    pub name: String,

    /// Image name
    pub image: String,

    /// Published host port
    pub host_port: u16,

    /// UI port inside the container
    pub container_port: u16,

    pub kind: NodeKind,
}

/// Container network runtime
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Lists all segments with their subnets
    async fn list_segments(&self) -> ProviderResult<Vec<SegmentSummary>>;

    /// Inspects a segment's subnet and members
    async fn inspect_segment(&self, name: &str) -> ProviderResult<SegmentInfo>;

    /// Creates a segment on `subnet`
    async fn create_segment(&self, name: &str, subnet: &Subnet) -> ProviderResult<()>;

    /// Deletes a segment
    async fn delete_segment(&self, name: &str) -> ProviderResult<()>;

    /// Attaches a container with a fixed address
    async fn connect(&self, segment: &str, container: &str, ip: Ipv4Addr) -> ProviderResult<()>;

    /// Detaches a container
    async fn disconnect(&self, segment: &str, container: &str) -> ProviderResult<()>;

    /// Runs a command inside a container; a non-zero exit is not an error
    async fn exec_in_container(&self, container: &str, args: &[String])
        -> ProviderResult<ExecResult>;

    /// True when the node image exists locally
    async fn image_exists(&self, image: &str) -> ProviderResult<bool>;

    /// Builds a node image from a build context directory
    async fn build_image(&self, image: &str, context: &Path) -> ProviderResult<()>;

    /// Launches a node container
    async fn run_container(&self, spec: &ContainerSpec) -> ProviderResult<()>;

    /// Stops a node container
    async fn stop_container(&self, name: &str) -> ProviderResult<()>;
}
