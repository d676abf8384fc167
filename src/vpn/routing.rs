//! Route string parsing for the tunnel device
//!
//! Routes arrive as CIDR strings. A malformed entry is skipped on its own;
//! it never stops the remaining routes from being registered.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("expected <address>/<prefix>, got {0:?}")]
    Malformed(String),
    #[error("Invalid prefix length in {0:?}")]
    InvalidPrefix(String),
    #[error("Invalid IP address in {0:?}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub address: IpAddr,
    pub prefix: u8,
}

impl Route {
    /// `0.0.0.0/0` or `::/0`
    pub fn is_default(&self) -> bool {
        self.prefix == 0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Route {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_route(s)
    }
}

/// Parse a single `<address>/<prefix>` string.
pub fn parse_route(route: &str) -> Result<Route, RouteError> {
    let trimmed = route.trim();
    let parts: Vec<&str> = trimmed.split('/').collect();
    let [address, prefix] = parts.as_slice() else {
        return Err(RouteError::Malformed(route.to_string()));
    };

    let prefix: u8 = prefix
        .parse()
        .map_err(|_| RouteError::InvalidPrefix(route.to_string()))?;
    let address: IpAddr = address
        .parse()
        .map_err(|_| RouteError::InvalidAddress(route.to_string()))?;

    let max = if address.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(RouteError::InvalidPrefix(route.to_string()));
    }

    Ok(Route { address, prefix })
}

/// Parse a route list, keeping the good entries and reporting the bad ones.
pub fn parse_routes<S: AsRef<str>>(routes: &[S]) -> (Vec<Route>, Vec<RouteError>) {
    let mut parsed = Vec::with_capacity(routes.len());
    let mut skipped = Vec::new();
    for route in routes {
        match parse_route(route.as_ref()) {
            Ok(r) => parsed.push(r),
            Err(e) => skipped.push(e),
        }
    }
    (parsed, skipped)
}
