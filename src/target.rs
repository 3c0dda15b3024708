use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A re-scan target in canonical form.
///
/// Bare addresses and full-length prefixes become `Address`; anything
/// shorter becomes a `Network` with its host bits cleared. Two targets are
/// equal exactly when their canonical strings are equal, which is what the
/// task queue uses for in-flight deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Target {
    Address(IpAddr),
    Network(IpNetwork),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetParseError {
    pub input: String,
}

impl fmt::Display for TargetParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address or network: {:?}", self.input)
    }
}

impl std::error::Error for TargetParseError {}

/// Parse `input` into its canonical network (host bits cleared).
/// A bare address yields a single-host network.
pub fn canonical_network(input: &str) -> Result<IpNetwork, TargetParseError> {
    let trimmed = input.trim();
    let err = || TargetParseError { input: input.to_string() };

    if trimmed.is_empty() {
        return Err(err());
    }

    let parsed = if trimmed.contains('/') {
        IpNetwork::from_str(trimmed).map_err(|_| err())?
    } else {
        let ip = IpAddr::from_str(trimmed).map_err(|_| err())?;
        IpNetwork::from(ip)
    };

    IpNetwork::new(parsed.network(), parsed.prefix()).map_err(|_| err())
}

/// Whether two canonical networks share at least one address
pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl Target {
    pub fn parse(input: &str) -> Result<Self, TargetParseError> {
        let network = canonical_network(input)?;
        Ok(Self::from_network(network))
    }

    pub fn from_network(network: IpNetwork) -> Self {
        if network.prefix() == max_prefix(&network.ip()) {
            Target::Address(network.network())
        } else {
            Target::Network(network)
        }
    }

    /// The target as a network; an address is its single-host network
    pub fn as_network(&self) -> IpNetwork {
        match self {
            Target::Address(ip) => IpNetwork::from(*ip),
            Target::Network(net) => *net,
        }
    }

    pub fn address(&self) -> Option<IpAddr> {
        match self {
            Target::Address(ip) => Some(*ip),
            Target::Network(_) => None,
        }
    }

    /// Every address covered by the target
    pub fn hosts(&self) -> impl Iterator<Item = IpAddr> {
        self.as_network().iter()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(ip) => write!(f, "{}", ip),
            Target::Network(net) => write!(f, "{}/{}", net.network(), net.prefix()),
        }
    }
}

impl FromStr for Target {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse(s)
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.to_string()
    }
}

impl TryFrom<String> for Target {
    type Error = TargetParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Target::parse(&value)
    }
}
