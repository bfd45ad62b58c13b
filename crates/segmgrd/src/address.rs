//! IPv4 address and subnet arithmetic.
//!
//! Every subnet that enters the segment manager is normalised here into a
//! [`Subnet`]: network address with host bits zeroed plus prefix length.
//! Equality, hashing and ordering are defined on that canonical pair, so
//! `10.0.0.5/24` and `10.0.0.9/255.255.255.0` are the same subnet.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix given to segment names derived from a subnet.
pub const SEGMENT_NAME_PREFIX: &str = "net_";

/// Address parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// Not a dotted-quad IPv4 address.
    #[error("Invalid IPv4 address '{input}'")]
    InvalidAddress {
        /// The rejected input.
        input: String,
    },

    /// Not four octets, an octet out of range, or non-contiguous bits.
    #[error("Invalid subnet mask '{mask}'")]
    InvalidMask {
        /// The rejected mask.
        mask: String,
    },

    /// Prefix length missing, not numeric or greater than 32.
    #[error("Invalid prefix length '{prefix}'")]
    InvalidPrefix {
        /// The rejected prefix.
        prefix: String,
    },
}

impl AddressError {
    fn address(input: &str) -> Self {
        Self::InvalidAddress {
            input: input.to_string(),
        }
    }

    fn mask(mask: &str) -> Self {
        Self::InvalidMask {
            mask: mask.to_string(),
        }
    }

    fn prefix(prefix: impl fmt::Display) -> Self {
        Self::InvalidPrefix {
            prefix: prefix.to_string(),
        }
    }
}

/// Canonical IPv4 subnet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet(Ipv4Net);

impl Subnet {
    /// Builds the subnet of `ip` with the given prefix length.
    pub fn new(ip: Ipv4Addr, prefix_len: u8) -> Result<Self, AddressError> {
        let net = Ipv4Net::new(ip, prefix_len).map_err(|_| AddressError::prefix(prefix_len))?;
        Ok(Self(net.trunc()))
    }

    /// Builds the subnet of `ip` under a dotted mask.
    pub fn with_mask(ip: Ipv4Addr, mask: &str) -> Result<Self, AddressError> {
        Self::new(ip, prefix_len(mask)?)
    }

    /// Network address (host bits zeroed).
    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    /// Broadcast address (host bits set).
    pub fn broadcast(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    /// Prefix length, 0..=32.
    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// Dotted netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        self.0.netmask()
    }

    /// True iff `ip` lies in `[network, broadcast]`, both ends included.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.0.contains(&ip)
    }

    /// True iff `ip` may be assigned to an endpoint.
    ///
    /// Network and broadcast addresses are reserved except on /31 and /32.
    pub fn is_host_address(&self, ip: Ipv4Addr) -> bool {
        self.contains(ip)
            && (self.prefix_len() >= 31 || (ip != self.network() && ip != self.broadcast()))
    }

    /// Deterministic segment name, e.g. `net_10_0_0_0_24`.
    pub fn segment_name(&self) -> String {
        format!(
            "{}{}_{}",
            SEGMENT_NAME_PREFIX,
            self.network().to_string().replace('.', "_"),
            self.prefix_len()
        )
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len())
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subnet({})", self)
    }
}

impl FromStr for Subnet {
    type Err = AddressError;

    /// Parses `ip/prefix` or `ip/dotted-mask`; host bits are discarded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, subnet) = parse_host_address(s, None)?;
        Ok(subnet)
    }
}

impl TryFrom<String> for Subnet {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

/// Parses a dotted-quad IPv4 address.
pub fn parse_ip(input: &str) -> Result<Ipv4Addr, AddressError> {
    input
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| AddressError::address(input))
}

/// Converts a dotted mask into a prefix length.
///
/// The mask must be exactly four decimal octets in 0..=255 whose bits are
/// contiguous from the left.
pub fn prefix_len(mask: &str) -> Result<u8, AddressError> {
    let octets: Vec<&str> = mask.trim().split('.').collect();
    if octets.len() != 4
        || !octets
            .iter()
            .all(|o| !o.is_empty() && o.len() <= 3 && o.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(AddressError::mask(mask));
    }

    let mut bytes = [0u8; 4];
    for (slot, octet) in bytes.iter_mut().zip(&octets) {
        *slot = octet.parse::<u8>().map_err(|_| AddressError::mask(mask))?;
    }

    ipnet::ipv4_mask_to_prefix(Ipv4Addr::from(bytes)).map_err(|_| AddressError::mask(mask))
}

/// Dotted mask for a prefix length.
pub fn mask_from_prefix(prefix_len: u8) -> Result<Ipv4Addr, AddressError> {
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, prefix_len)
        .map(|net| net.netmask())
        .map_err(|_| AddressError::prefix(prefix_len))
}

/// Splits a host address into its IP and canonical subnet.
///
/// With `mask` set, `input` may be a bare IP or carry a suffix that is
/// ignored in favour of the mask (the host form submits both). Without a
/// mask, `input` must be `ip/prefix` or `ip/dotted-mask`.
pub fn parse_host_address(
    input: &str,
    mask: Option<&str>,
) -> Result<(Ipv4Addr, Subnet), AddressError> {
    let input = input.trim();
    let (ip_part, suffix) = match input.split_once('/') {
        Some((ip, suffix)) => (ip, Some(suffix)),
        None => (input, None),
    };
    let ip = parse_ip(ip_part)?;

    let prefix = match (mask, suffix) {
        (Some(mask), _) => prefix_len(mask)?,
        (None, Some(suffix)) if suffix.contains('.') => prefix_len(suffix)?,
        (None, Some(suffix)) => suffix
            .parse::<u8>()
            .map_err(|_| AddressError::prefix(suffix))?,
        (None, None) => return Err(AddressError::prefix("")),
    };

    Ok((ip, Subnet::new(ip, prefix)?))
}
