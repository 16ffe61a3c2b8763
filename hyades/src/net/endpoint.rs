//! Network endpoints and rank tables.
//!
//! A multi-process group is described by one endpoint per rank, in rank order.
//! The table is usually written as a comma separated list
//! (`127.0.0.1:7100,127.0.0.1:7101`) in a launcher script or environment variable.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// A network endpoint (IP address + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates a new endpoint from an IP address and port.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<SocketAddr>().map(Self)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Parses a comma separated endpoint list into a rank-ordered table.
///
/// # Errors
/// Returns the first address that fails to parse.
pub fn parse_rank_table(list: &str) -> Result<Vec<Endpoint>, std::net::AddrParseError> {
    list.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_localhost() {
        let ep = Endpoint::localhost(3000);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(ep.port(), 3000);
    }

    #[test]
    fn endpoint_display_round_trip() {
        let ep: Endpoint = " 10.0.0.1:5000 ".parse().unwrap();
        assert_eq!(format!("{ep}"), "10.0.0.1:5000");
        assert_eq!(ep.as_socket_addr(), "10.0.0.1:5000".parse().unwrap());
    }

    #[test]
    fn rank_table_keeps_order() {
        let table = parse_rank_table("127.0.0.1:7101, 127.0.0.1:7100,").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].port(), 7101);
        assert_eq!(table[1].port(), 7100);
    }

    #[test]
    fn rank_table_rejects_garbage() {
        assert!(parse_rank_table("127.0.0.1:7100,nope").is_err());
    }
}
