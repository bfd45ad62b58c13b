//! Conflict checks for proposed interfaces and routes.
//!
//! Pure functions over supplied state: no provider calls and no side
//! effects, so every rule is unit-testable without a container runtime.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::address::{AddressError, Subnet};
use crate::types::{Interface, NodeKind, Route, Segment};

/// Validation failures. Never reach the provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// Address, mask or prefix failed to parse
    #[error(transparent)]
    Address(#[from] AddressError),

    /// Route destination is not a valid subnet
    #[error("Invalid route destination '{input}': {source}")]
    InvalidDestination {
        input: String,
        #[source]
        source: AddressError,
    },

    /// Network or broadcast address of the subnet
    #[error("{ip} is the network or broadcast address of {subnet}")]
    ReservedAddress { ip: Ipv4Addr, subnet: Subnet },

    /// Gateway equal to the interface's own address
    #[error("Gateway {gateway} is the interface's own address")]
    GatewayIsSelf { gateway: Ipv4Addr },

    /// Another interface of the same node is on this subnet
    #[error("Subnet {subnet} is already assigned to interface {interface}")]
    SubnetCollision { subnet: Subnet, interface: String },

    /// Gateway not contained in the interface subnet
    #[error("Gateway {gateway} is not in subnet {subnet}")]
    GatewayOutOfSubnet { gateway: Ipv4Addr, subnet: Subnet },

    /// Host interface declared without a gateway
    #[error("Interface {interface} requires a default gateway")]
    GatewayRequired { interface: String },

    /// Address already held on the target segment by another node
    #[error("IP address {ip} is already in use on segment {segment}{}", .holder.as_ref().map(|h| format!(" by {}", h)).unwrap_or_default())]
    AddressInUse {
        ip: Ipv4Addr,
        segment: String,
        holder: Option<String>,
    },

    /// No interface subnet contains the next hop
    #[error("Next hop {next_hop} is not reachable via any interface")]
    NextHopUnreachable { next_hop: Ipv4Addr },

    /// Next hop is an address of the node itself
    #[error("Next hop {next_hop} is the address of interface {interface}")]
    NextHopIsLocal { next_hop: Ipv4Addr, interface: String },

    /// Destination is directly connected through an interface
    #[error("Destination {destination} is directly connected via {interface}")]
    DestinationConnected {
        destination: Subnet,
        interface: String,
    },

    /// Node already has all the interfaces its kind allows
    #[error("Node {node} already has {limit} interface(s) configured")]
    InterfaceLimit { node: String, limit: usize },

    /// Interface name not valid for the node kind
    #[error("Interface '{name}' does not exist on a {kind} node")]
    InvalidInterfaceName { name: String, kind: NodeKind },
}

/// Validates a proposed interface.
///
/// `others` are the node's interfaces excluding the one being replaced;
/// `target` is the registry's record for the proposed subnet, if any.
pub fn check_interface<'a>(
    node: &str,
    kind: NodeKind,
    proposed: &Interface,
    others: impl IntoIterator<Item = &'a Interface>,
    target: Option<&Segment>,
) -> Result<(), ConflictError> {
    if !kind.interface_names().contains(&proposed.name.as_str()) {
        return Err(ConflictError::InvalidInterfaceName {
            name: proposed.name.clone(),
            kind,
        });
    }

    if !proposed.subnet.is_host_address(proposed.ip) {
        return Err(ConflictError::ReservedAddress {
            ip: proposed.ip,
            subnet: proposed.subnet,
        });
    }

    match proposed.gateway {
        Some(gateway) if !proposed.subnet.contains(gateway) => {
            return Err(ConflictError::GatewayOutOfSubnet {
                gateway,
                subnet: proposed.subnet,
            });
        }
        Some(gateway) if gateway == proposed.ip => {
            return Err(ConflictError::GatewayIsSelf { gateway });
        }
        Some(gateway) if !proposed.subnet.is_host_address(gateway) => {
            return Err(ConflictError::ReservedAddress {
                ip: gateway,
                subnet: proposed.subnet,
            });
        }
        None if kind.requires_gateway() => {
            return Err(ConflictError::GatewayRequired {
                interface: proposed.name.clone(),
            });
        }
        _ => {}
    }

    let mut count = 1;
    for other in others {
        if other.subnet == proposed.subnet {
            return Err(ConflictError::SubnetCollision {
                subnet: proposed.subnet,
                interface: other.name.clone(),
            });
        }
        count += 1;
    }
    if count > kind.max_interfaces() {
        return Err(ConflictError::InterfaceLimit {
            node: node.to_string(),
            limit: kind.max_interfaces(),
        });
    }

    if let Some(segment) = target {
        if let Some(holder) = segment.holder_of(proposed.ip) {
            if holder.node != node {
                return Err(ConflictError::AddressInUse {
                    ip: proposed.ip,
                    segment: segment.name.clone(),
                    holder: Some(holder.node.clone()),
                });
            }
        }
    }

    Ok(())
}

/// Validates a static route against the node's interfaces.
///
/// The next hop must sit on an interface subnet without being the node's
/// own address, and the destination must not be a connected subnet.
pub fn check_route<'a>(
    route: &Route,
    interfaces: impl IntoIterator<Item = &'a Interface>,
) -> Result<(), ConflictError> {
    let mut reachable = false;
    for iface in interfaces {
        if iface.ip == route.next_hop {
            return Err(ConflictError::NextHopIsLocal {
                next_hop: route.next_hop,
                interface: iface.name.clone(),
            });
        }
        if iface.subnet == route.destination {
            return Err(ConflictError::DestinationConnected {
                destination: route.destination,
                interface: iface.name.clone(),
            });
        }
        reachable |= iface.subnet.contains(route.next_hop);
    }

    if reachable {
        Ok(())
    } else {
        Err(ConflictError::NextHopUnreachable {
            next_hop: route.next_hop,
        })
    }
}
