//! Matching of literal client addresses against exact, wildcard and CIDR patterns.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::utils::ValidationError;

/// Validated IP pattern
///
/// Patterns are parsed once at the write boundary; matching never fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpPattern {
    /// Single address, compared byte for byte
    Exact(IpAddr),
    /// `a.b.c.*`: first three octets fixed, any fourth octet
    Wildcard([u8; 3]),
    /// `a.b.c.d/n`
    Cidr(IpNet),
}

impl IpPattern {
    pub fn matches(&self, candidate: &IpAddr) -> bool {
        matches(candidate, self)
    }
}

/// Returns true when `candidate` falls under `pattern`
pub fn matches(candidate: &IpAddr, pattern: &IpPattern) -> bool {
    match pattern {
        IpPattern::Exact(addr) => addr == candidate,
        IpPattern::Wildcard(prefix) => match candidate {
            IpAddr::V4(v4) => v4.octets()[..3] == prefix[..],
            IpAddr::V6(_) => false,
        },
        // Network addresses of both sides under the pattern's mask
        IpPattern::Cidr(net) => net.contains(candidate),
    }
}

impl FromStr for IpPattern {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let invalid = || ValidationError::InvalidPattern(raw.to_string());

        if raw.contains('/') {
            return IpNet::from_str(raw).map(IpPattern::Cidr).map_err(|_| invalid());
        }

        if let Some(prefix) = raw.strip_suffix(".*") {
            let octets: Vec<&str> = prefix.split('.').collect();
            if octets.len() != 3 {
                return Err(invalid());
            }
            let mut parsed = [0u8; 3];
            for (slot, octet) in parsed.iter_mut().zip(&octets) {
                if octet.is_empty() || octet.len() > 3 || !octet.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                *slot = octet.parse().map_err(|_| invalid())?;
            }
            return Ok(IpPattern::Wildcard(parsed));
        }

        IpAddr::from_str(raw).map(IpPattern::Exact).map_err(|_| invalid())
    }
}

impl TryFrom<String> for IpPattern {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<IpPattern> for String {
    fn from(pattern: IpPattern) -> Self {
        pattern.to_string()
    }
}

impl fmt::Display for IpPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpPattern::Exact(addr) => write!(f, "{}", addr),
            IpPattern::Wildcard([a, b, c]) => write!(f, "{}.{}.{}.*", a, b, c),
            IpPattern::Cidr(net) => write!(f, "{}", net),
        }
    }
}
