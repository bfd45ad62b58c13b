//! Error types for the segment manager

use thiserror::Error;

use crate::config::ConfigError;
use crate::conflict::ConflictError;
use crate::provider::ProviderError;
use crate::reconciler::ReconcileStep;
use crate::state::StateError;

/// Result type for segment manager operations
pub type SegMgrResult<T> = Result<T, SegMgrError>;

/// Segment manager errors
#[derive(Debug, Error)]
pub enum SegMgrError {
    /// Request rejected before any provider call
    #[error(transparent)]
    Validation(#[from] ConflictError),

    /// Provider call failed with nothing changed yet
    #[error("Failed to {step}: {source}")]
    Provider {
        step: &'static str,
        #[source]
        source: ProviderError,
    },

    /// Interface change stopped part way
    #[error("Configuration of {node} aborted after {last_step} ({}): {source}", describe_attachment(.attached_to, .restored_old))]
    Aborted {
        node: String,
        last_step: ReconcileStep,
        /// Old attachment was reconnected after a failed attach
        restored_old: bool,
        /// Segment the interface is attached to now, if any
        attached_to: Option<String>,
        #[source]
        source: Box<SegMgrError>,
    },

    /// Route not reachable through any interface of the node
    #[error("Route rejected on {node}: {source}")]
    RouteRejected {
        node: String,
        #[source]
        source: ConflictError,
    },

    /// Route saved but not installed in the node
    #[error("Route {destination} saved but not applied on {node}: {message}")]
    RouteApplyFailed {
        node: String,
        destination: String,
        message: String,
    },

    /// Route removed from the config but still installed in the node
    #[error("Route {destination} removed but still present on {node}: {message}")]
    RouteRemoveFailed {
        node: String,
        destination: String,
        message: String,
    },

    #[error("Unknown node '{node}'")]
    UnknownNode { node: String },

    #[error("Node {node} has no interface {interface}")]
    UnknownInterface { node: String, interface: String },

    #[error("Node {node} has no route to {destination}")]
    UnknownRoute { node: String, destination: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn describe_attachment(attached_to: &Option<String>, restored_old: &bool) -> String {
    match (attached_to, *restored_old) {
        (Some(segment), true) => format!("restored on {}", segment),
        (Some(segment), false) => format!("still on {}", segment),
        (None, _) => "not attached".to_string(),
    }
}

impl SegMgrError {
    pub fn provider(step: &'static str, source: ProviderError) -> Self {
        Self::Provider { step, source }
    }

    pub fn unknown_node(node: &str) -> Self {
        Self::UnknownNode {
            node: node.to_string(),
        }
    }

    /// The validation error behind this error, if any
    pub fn conflict(&self) -> Option<&ConflictError> {
        match self {
            Self::Validation(err) | Self::RouteRejected { source: err, .. } => Some(err),
            Self::Aborted { source, .. } => source.conflict(),
            _ => None,
        }
    }

    /// The provider error behind this error, if any
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Provider { source, .. } => Some(source),
            Self::Aborted { source, .. } => source.provider_error(),
            _ => None,
        }
    }

    /// True if the request was refused before touching the provider
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::RouteRejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_through_abort() {
        let err = SegMgrError::Aborted {
            node: "host2".to_string(),
            last_step: ReconcileStep::OldDetached,
            restored_old: true,
            attached_to: Some("net_10_0_1_0_24".to_string()),
            source: Box::new(SegMgrError::Validation(ConflictError::AddressInUse {
                ip: "10.0.0.2".parse().unwrap(),
                segment: "net_10_0_0_0_24".to_string(),
                holder: None,
            })),
        };
        assert!(matches!(
            err.conflict(),
            Some(ConflictError::AddressInUse { .. })
        ));
        assert!(!err.is_validation());
        assert_eq!(
            err.to_string(),
            "Configuration of host2 aborted after OldDetached (restored on net_10_0_1_0_24): \
             IP address 10.0.0.2 is already in use on segment net_10_0_0_0_24"
        );
    }

    #[test]
    fn test_provider_error_lookup() {
        let err = SegMgrError::provider("list segments", ProviderError::parse("bad json"));
        assert!(err.provider_error().is_some());
        assert!(err.conflict().is_none());
        assert_eq!(
            err.to_string(),
            "Failed to list segments: Unexpected provider output: bad json"
        );
    }
}
