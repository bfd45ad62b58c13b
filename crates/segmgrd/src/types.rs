//! Segment Manager Type Definitions

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::{self, Subnet};
use crate::conflict::ConflictError;
use crate::tables::*;

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// End host: one interface, gateway implies a default route
    Host,

    /// Router: up to five interfaces, static routes only
    Router,
}

impl NodeKind {
    /// Lowercase name, also used as image name and container name prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Host => "host",
            NodeKind::Router => "router",
        }
    }

    /// Interface names a node of this kind may configure
    pub fn interface_names(&self) -> &'static [&'static str] {
        match self {
            NodeKind::Host => HOST_INTERFACES,
            NodeKind::Router => ROUTER_INTERFACES,
        }
    }

    /// Interface used when a request does not name one
    pub fn default_interface(&self) -> &'static str {
        self.interface_names()[0]
    }

    /// Maximum number of configured interfaces
    pub fn max_interfaces(&self) -> usize {
        self.interface_names().len()
    }

    /// Whether an interface gateway is installed as the default route
    pub fn installs_default_route(&self) -> bool {
        matches!(self, NodeKind::Host)
    }

    /// Whether interfaces of this kind must declare a gateway
    pub fn requires_gateway(&self) -> bool {
        matches!(self, NodeKind::Host)
    }

    /// Port the node's management UI listens on inside its container
    pub fn container_port(&self) -> u16 {
        match self {
            NodeKind::Host => HOST_BASE_PORT,
            NodeKind::Router => ROUTER_BASE_PORT,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("host") {
            Ok(NodeKind::Host)
        } else if s.eq_ignore_ascii_case("router") {
            Ok(NodeKind::Router)
        } else {
            Err(format!("unknown node kind '{}'", s))
        }
    }
}

/// A configured network interface of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name (eth0, Ethernet0..Ethernet4)
    pub name: String,

    /// Host address on the segment
    pub ip: Ipv4Addr,

    /// Canonical subnet; contains `ip` and `gateway`
    pub subnet: Subnet,

    /// Gateway, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

impl Interface {
    /// `ip/prefix` form, e.g. `10.0.0.2/24`
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ip, self.subnet.prefix_len())
    }
}

/// User-supplied interface configuration, not yet validated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRequest {
    /// Interface name; the node kind's default when absent
    pub name: Option<String>,

    /// `ip`, `ip/prefix` or `ip/dotted-mask`
    pub address: String,

    /// Dotted mask; overrides any suffix on `address`
    pub mask: Option<String>,

    /// Gateway address
    pub gateway: Option<String>,
}

impl InterfaceRequest {
    /// Request for `address` in CIDR form
    pub fn cidr(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Request for a bare address plus dotted mask
    pub fn with_mask(address: impl Into<String>, mask: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            mask: Some(mask.into()),
            ..Default::default()
        }
    }

    /// Sets the gateway
    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    /// Sets the interface name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parses and normalises the request for a node of `kind`
    pub fn resolve(&self, kind: NodeKind) -> Result<Interface, ConflictError> {
        let (ip, subnet) = address::parse_host_address(&self.address, self.mask.as_deref())?;
        let gateway = self
            .gateway
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(address::parse_ip)
            .transpose()?;

        Ok(Interface {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| kind.default_interface().to_string()),
            ip,
            subnet,
            gateway,
        })
    }
}

/// Route installation state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    /// Next hop reachable through a configured interface
    #[default]
    Active,

    /// The interface that reached the next hop was removed or replaced
    Stale,
}

/// Static route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination subnet
    pub destination: Subnet,

    /// Gateway the route forwards through
    pub next_hop: Ipv4Addr,

    /// Installation state
    #[serde(default)]
    pub status: RouteStatus,
}

impl Route {
    /// Creates an active route
    pub fn new(destination: Subnet, next_hop: Ipv4Addr) -> Self {
        Self {
            destination,
            next_hop,
            status: RouteStatus::Active,
        }
    }

    /// Parses destination and next hop from user input
    pub fn parse(destination: &str, next_hop: &str) -> Result<Self, ConflictError> {
        let destination = parse_destination(destination)?;
        let next_hop = address::parse_ip(next_hop)?;
        Ok(Self::new(destination, next_hop))
    }

    /// Whether the route is currently considered installed
    pub fn is_active(&self) -> bool {
        self.status == RouteStatus::Active
    }
}

/// Parses a route destination in CIDR form
pub fn parse_destination(destination: &str) -> Result<Subnet, ConflictError> {
    destination
        .parse::<Subnet>()
        .map_err(|source| ConflictError::InvalidDestination {
            input: destination.to_string(),
            source,
        })
}

/// Simulated node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node id; also the container name (host1, router2)
    pub id: String,

    /// Node kind
    pub kind: NodeKind,

    /// Configured interfaces by name
    #[serde(default)]
    pub interfaces: BTreeMap<String, Interface>,

    /// Static routes in declaration order
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Node {
    /// Creates a node without interfaces or routes
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            interfaces: BTreeMap::new(),
            routes: Vec::new(),
        }
    }

    /// Infers the kind from an id of the form `<kind><index>`
    pub fn from_id(id: &str) -> Option<Self> {
        let (kind, index) = split_node_id(id)?;
        let kind = kind.parse::<NodeKind>().ok()?;
        index.parse::<u32>().ok()?;
        Some(Self::new(id, kind))
    }

    /// Container name for the `index`-th node of `kind`
    pub fn container_name(kind: NodeKind, index: u32) -> String {
        format!("{}{}", kind.as_str(), index)
    }

    /// Interfaces other than `name`
    pub fn other_interfaces<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Interface> {
        self.interfaces.values().filter(move |i| i.name != name)
    }

    /// Whether `ip` lies in the subnet of some interface
    pub fn reaches(&self, ip: Ipv4Addr) -> bool {
        self.interfaces.values().any(|i| i.subnet.contains(ip))
    }

    /// Index of the route towards `destination`
    pub fn route_index(&self, destination: &Subnet) -> Option<usize> {
        self.routes.iter().position(|r| r.destination == *destination)
    }

    /// Flags active routes whose next hop is no longer reachable.
    ///
    /// Returns the destinations that became stale.
    pub fn invalidate_unreachable_routes(&mut self) -> Vec<Subnet> {
        let reachable: Vec<bool> = self.routes.iter().map(|r| self.reaches(r.next_hop)).collect();
        self.routes
            .iter_mut()
            .zip(reachable)
            .filter(|(route, ok)| route.is_active() && !ok)
            .map(|(route, _)| {
                route.status = RouteStatus::Stale;
                route.destination
            })
            .collect()
    }
}

fn split_node_id(id: &str) -> Option<(&str, &str)> {
    let split = id.find(|c: char| c.is_ascii_digit())?;
    Some(id.split_at(split))
}

/// Segment member: a node attached with a specific address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Member {
    /// Node id (container name)
    pub node: String,

    /// Address the node holds on the segment
    pub ip: Ipv4Addr,
}

impl Member {
    pub fn new(node: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            node: node.into(),
            ip,
        }
    }
}

/// Isolated L3 segment backed by a provider network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Provider handle
    pub name: String,

    /// Canonical subnet; the registry key
    pub subnet: Subnet,

    /// Attached nodes
    #[serde(default)]
    pub members: BTreeSet<Member>,
}

impl Segment {
    /// Creates a segment without members
    pub fn new(name: impl Into<String>, subnet: Subnet) -> Self {
        Self {
            name: name.into(),
            subnet,
            members: BTreeSet::new(),
        }
    }

    /// Membership of `node`, if attached
    pub fn member(&self, node: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.node == node)
    }

    /// Member holding `ip`, if any
    pub fn holder_of(&self, ip: Ipv4Addr) -> Option<&Member> {
        self.members.iter().find(|m| m.ip == ip)
    }

    /// An empty segment is garbage
    pub fn is_deletable(&self) -> bool {
        self.members.is_empty()
    }
}

/// Summary status of a configuration request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Desired state reached with provider changes
    Applied,

    /// Desired state already in place, nothing mutated
    Unchanged,

    /// Primary change committed, a follow-up step failed
    PartialSuccess,
}

/// Summary message returned to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub message: String,
}

impl Outcome {
    pub fn applied(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Applied,
            message: message.into(),
        }
    }

    pub fn unchanged(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Unchanged,
            message: message.into(),
        }
    }

    pub fn partial(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::PartialSuccess,
            message: message.into(),
        }
    }

    /// Builds an outcome from a message and the notes of failed follow-ups
    pub fn with_notes(message: impl Into<String>, notes: Vec<String>) -> Self {
        let message = message.into();
        if notes.is_empty() {
            Self::applied(message)
        } else {
            Self::partial(format!("{}; {}", message, notes.join("; ")))
        }
    }

    pub fn is_partial(&self) -> bool {
        self.status == OutcomeStatus::PartialSuccess
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
