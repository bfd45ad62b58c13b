//! Test fixtures for common topology changes
//!
//! Provides reusable requests and multi-step scenarios

use netsim_segmgrd::{InterfaceRequest, OutcomeStatus, Route};

/// One request against the segment manager
#[derive(Debug, Clone)]
pub enum Step {
    ConfigureInterface {
        node: String,
        request: InterfaceRequest,
    },
    DeleteInterface {
        node: String,
        name: String,
    },
    AddRoute {
        node: String,
        destination: String,
        next_hop: String,
    },
    DeleteRoute {
        node: String,
        destination: String,
    },
}

impl Step {
    /// Node the step targets
    pub fn node(&self) -> &str {
        match self {
            Step::ConfigureInterface { node, .. }
            | Step::DeleteInterface { node, .. }
            | Step::AddRoute { node, .. }
            | Step::DeleteRoute { node, .. } => node,
        }
    }

    /// Parses the route carried by an `AddRoute` step
    pub fn route(&self) -> Option<Route> {
        match self {
            Step::AddRoute {
                destination,
                next_hop,
                ..
            } => Route::parse(destination, next_hop).ok(),
            _ => None,
        }
    }
}

/// What a step is expected to produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Outcome with this status
    Outcome(OutcomeStatus),

    /// Error whose message contains the text
    ErrorContaining(String),
}

/// Host interface fixtures
pub mod host_fixtures {
    use super::*;

    /// Host eth0 with gateway
    pub fn host_interface(node: &str, address: &str, gateway: &str) -> Step {
        Step::ConfigureInterface {
            node: node.to_string(),
            request: InterfaceRequest::cidr(address).gateway(gateway),
        }
    }

    /// Host eth0 given as address plus dotted mask
    pub fn host_interface_with_mask(node: &str, ip: &str, mask: &str, gateway: &str) -> Step {
        Step::ConfigureInterface {
            node: node.to_string(),
            request: InterfaceRequest::with_mask(ip, mask).gateway(gateway),
        }
    }

    /// Remove host eth0
    pub fn delete_host_interface(node: &str) -> Step {
        Step::DeleteInterface {
            node: node.to_string(),
            name: "eth0".to_string(),
        }
    }
}

/// Router interface and route fixtures
pub mod router_fixtures {
    use super::*;

    /// Router port without gateway
    pub fn router_interface(node: &str, name: &str, address: &str) -> Step {
        Step::ConfigureInterface {
            node: node.to_string(),
            request: InterfaceRequest::cidr(address).named(name),
        }
    }

    /// Remove a router port
    pub fn delete_router_interface(node: &str, name: &str) -> Step {
        Step::DeleteInterface {
            node: node.to_string(),
            name: name.to_string(),
        }
    }

    /// Static route
    pub fn static_route(node: &str, destination: &str, next_hop: &str) -> Step {
        Step::AddRoute {
            node: node.to_string(),
            destination: destination.to_string(),
            next_hop: next_hop.to_string(),
        }
    }

    /// Remove a static route
    pub fn delete_route(node: &str, destination: &str) -> Step {
        Step::DeleteRoute {
            node: node.to_string(),
            destination: destination.to_string(),
        }
    }
}

/// Multi-step scenario with an expectation per step
#[derive(Debug)]
pub struct TestScenario {
    pub name: String,
    pub steps: Vec<(Step, Expect)>,
}

impl TestScenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Adds a step expected to finish with `status`
    pub fn expect_status(mut self, step: Step, status: OutcomeStatus) -> Self {
        self.steps.push((step, Expect::Outcome(status)));
        self
    }

    /// Adds a step expected to be applied
    pub fn expect_applied(self, step: Step) -> Self {
        self.expect_status(step, OutcomeStatus::Applied)
    }

    /// Adds a step expected to fail with a message containing `text`
    pub fn expect_error(mut self, step: Step, text: impl Into<String>) -> Self {
        self.steps.push((step, Expect::ErrorContaining(text.into())));
        self
    }
}
