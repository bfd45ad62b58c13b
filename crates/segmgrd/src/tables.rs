//! Constants for node kinds, ports and provider defaults

/// Interface names of a host node
pub const HOST_INTERFACES: &[&str] = &["eth0"];

/// Interface names of a router node
pub const ROUTER_INTERFACES: &[&str] = &[
    "Ethernet0",
    "Ethernet1",
    "Ethernet2",
    "Ethernet3",
    "Ethernet4",
];

/// Router management UI port inside its container
pub const ROUTER_BASE_PORT: u16 = 5002;

/// Host management UI port inside its container
pub const HOST_BASE_PORT: u16 = 5003;

/// Host port stride between consecutive node indexes
pub const NODE_PORT_STRIDE: u16 = 10;

/// Capability nodes need to edit their routing tables
pub const NODE_CAPABILITY: &str = "NET_ADMIN";

/// Docker socket, mounted so node UIs can drive the provider themselves
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Provider networks that are never garbage-collected
pub const DEFAULT_PROTECTED_SEGMENTS: &[&str] = &["bridge", "host", "none"];

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/netsim/segmgrd.toml";

/// Default state snapshot location
pub const DEFAULT_STATE_PATH: &str = "/var/lib/netsim/segmgrd.json";

/// Default parent of the node image build contexts
pub const DEFAULT_IMAGE_CONTEXT: &str = "..";

/// Snapshot format version
pub const STATE_VERSION: u32 = 1;

/// Route target keyword for the default route
pub const DEFAULT_ROUTE: &str = "default";
