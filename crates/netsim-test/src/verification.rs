//! Verification helpers for topology state and executed commands

use std::net::Ipv4Addr;

use netsim_segmgrd::{MockProvider, ProviderOp, RouteStatus, SegMgr};
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Scenario '{scenario}' step {index}: expected {expected}, got {actual}")]
    StepMismatch {
        scenario: String,
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("Segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("Segment '{name}' still exists")]
    SegmentPresent { name: String },

    #[error("Members of '{name}': expected {expected:?}, got {actual:?}")]
    MembersMismatch {
        name: String,
        expected: Vec<(String, Ipv4Addr)>,
        actual: Vec<(String, Ipv4Addr)>,
    },

    #[error("Route {destination} on {node}: expected {expected}, got {actual}")]
    RouteMismatch {
        node: String,
        destination: String,
        expected: String,
        actual: String,
    },

    #[error("Expected command '{expected}' in {actual:?}")]
    CommandMissing { expected: String, actual: Vec<String> },

    #[error("Unexpected command '{unexpected}'")]
    CommandPresent { unexpected: String },

    #[error("Expected {expected} {what}, found {actual}")]
    CountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Provider-side topology verifier
pub struct TopologyVerifier<'a> {
    mock: &'a MockProvider,
}

impl<'a> TopologyVerifier<'a> {
    pub fn new(mock: &'a MockProvider) -> Self {
        Self { mock }
    }

    /// Segment exists with exactly these members
    pub fn assert_members(&self, name: &str, expected: &[(&str, &str)]) -> VerifyResult<()> {
        let info = self
            .mock
            .segment(name)
            .ok_or_else(|| VerificationError::SegmentNotFound {
                name: name.to_string(),
            })?;
        let mut expected: Vec<(String, Ipv4Addr)> = expected
            .iter()
            .filter_map(|(node, ip)| Some((node.to_string(), ip.parse().ok()?)))
            .collect();
        expected.sort();
        let mut actual = info.members;
        actual.sort();
        if actual != expected {
            return Err(VerificationError::MembersMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn assert_segment_absent(&self, name: &str) -> VerifyResult<()> {
        if self.mock.segment(name).is_some() {
            return Err(VerificationError::SegmentPresent {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn assert_segment_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.mock.segment_names().len();
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                what: "segments".to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Kernel route of `node` towards `destination` ("default" included)
    pub fn assert_kernel_route(&self, node: &str, destination: &str, via: &str) -> VerifyResult<()> {
        let actual = self.mock.routes(node).get(destination).copied();
        match actual {
            Some(gw) if gw.to_string() == via => Ok(()),
            other => Err(VerificationError::RouteMismatch {
                node: node.to_string(),
                destination: destination.to_string(),
                expected: format!("via {}", via),
                actual: other.map_or_else(|| "no route".to_string(), |gw| format!("via {}", gw)),
            }),
        }
    }

    /// No provider call changed anything
    pub fn assert_no_mutation(&self) -> VerifyResult<()> {
        let mutations = self.mock.mutations();
        if !mutations.is_empty() {
            return Err(VerificationError::CountMismatch {
                what: "mutations".to_string(),
                expected: 0,
                actual: mutations.len(),
            });
        }
        Ok(())
    }

    /// No segment was deleted and no container was disconnected
    pub fn assert_no_destructive_op(&self) -> VerifyResult<()> {
        match self.mock.journal().into_iter().find(ProviderOp::is_destructive) {
            Some(op) => Err(VerificationError::CommandPresent {
                unexpected: format!("{:?}", op),
            }),
            None => Ok(()),
        }
    }
}

/// Manager-side route verifier
pub struct RouteVerifier<'a> {
    mgr: &'a SegMgr,
}

impl<'a> RouteVerifier<'a> {
    pub fn new(mgr: &'a SegMgr) -> Self {
        Self { mgr }
    }

    /// Recorded route status of `destination` on `node`
    pub fn assert_status(&self, node: &str, destination: &str, expected: RouteStatus) -> VerifyResult<()> {
        let actual = self.mgr.node(node).and_then(|n| {
            n.routes
                .iter()
                .find(|r| r.destination.to_string() == destination)
                .map(|r| r.status)
        });
        if actual != Some(expected) {
            return Err(VerificationError::RouteMismatch {
                node: node.to_string(),
                destination: destination.to_string(),
                expected: format!("{:?}", expected),
                actual: format!("{:?}", actual),
            });
        }
        Ok(())
    }
}

/// Verifier over commands executed inside one container
pub struct CommandVerifier {
    captured_commands: Vec<String>,
}

impl CommandVerifier {
    pub fn new(captured_commands: Vec<String>) -> Self {
        Self { captured_commands }
    }

    /// Commands the mock saw inside `container`
    pub fn for_container(mock: &MockProvider, container: &str) -> Self {
        Self::new(mock.exec_commands(container))
    }

    pub fn assert_command_executed(&self, expected: &str) -> VerifyResult<()> {
        if self.captured_commands.iter().any(|cmd| cmd.contains(expected)) {
            Ok(())
        } else {
            Err(VerificationError::CommandMissing {
                expected: expected.to_string(),
                actual: self.captured_commands.clone(),
            })
        }
    }

    pub fn assert_command_not_executed(&self, unexpected: &str) -> VerifyResult<()> {
        if self.captured_commands.iter().any(|cmd| cmd.contains(unexpected)) {
            Err(VerificationError::CommandPresent {
                unexpected: unexpected.to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub fn assert_command_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.captured_commands.len();
        if actual != expected {
            return Err(VerificationError::CountMismatch {
                what: "commands".to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_verifier() {
        let verifier = CommandVerifier::new(vec![
            "ip route del default".to_string(),
            "ip route add default via 10.0.0.1".to_string(),
        ]);

        assert!(verifier.assert_command_executed("via 10.0.0.1").is_ok());
        assert!(verifier.assert_command_not_executed("192.168.0.0/16").is_ok());
        assert!(verifier.assert_command_count(2).is_ok());
        assert!(verifier.assert_command_count(3).is_err());
        assert!(verifier.assert_command_executed("ping").is_err());
    }

    #[test]
    fn test_topology_verifier_on_mock() {
        let mock = MockProvider::new();
        mock.insert_segment("net_10_0_0_0_24", Some("10.0.0.0/24"));
        mock.attach("net_10_0_0_0_24", "host1", "10.0.0.2".parse().unwrap());

        let verifier = TopologyVerifier::new(&mock);
        assert!(verifier
            .assert_members("net_10_0_0_0_24", &[("host1", "10.0.0.2")])
            .is_ok());
        assert!(verifier.assert_members("net_10_0_0_0_24", &[]).is_err());
        assert!(verifier.assert_segment_absent("net_10_0_1_0_24").is_ok());
        assert!(verifier.assert_segment_count(1).is_ok());
        assert!(verifier.assert_no_mutation().is_ok());
    }
}
