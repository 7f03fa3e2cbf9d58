// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! IPv4 CIDR ranges and address classification for discovery.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// An IPv4 network in canonical form: host bits are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Range {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Range {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::InvalidAddress(format!("{}/{}", addr, prefix)));
        }
        let mask: u32 = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// The subnet of the given width that contains `addr`.
    pub fn enclosing(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        Self::new(addr, prefix)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        match Self::new(addr, self.prefix) {
            Ok(range) => range.network == self.network,
            Err(_) => false,
        }
    }

    /// Iterate the usable host addresses. Networks narrower than /31 skip
    /// the network and broadcast addresses.
    pub fn hosts(&self) -> Hosts {
        let base = u64::from(u32::from(self.network));
        let size = 1u64 << (32 - u32::from(self.prefix));
        if self.prefix < 31 {
            Hosts {
                current: base + 1,
                end: base + size - 1,
            }
        } else {
            Hosts {
                current: base,
                end: base + size,
            }
        }
    }
}

impl FromStr for Ipv4Range {
    type Err = Error;

    /// Parse `a.b.c.d/len`; a bare address is a /32.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_owned());
        match s.split_once('/') {
            None => {
                let addr = s.parse::<Ipv4Addr>().map_err(|_| invalid())?;
                Self::new(addr, 32)
            }
            Some((addr, prefix)) => {
                let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
                let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
                if prefix > 32 {
                    return Err(invalid());
                }
                Self::new(addr, prefix)
            }
        }
    }
}

impl std::fmt::Display for Ipv4Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Iterator over the host addresses of an [`Ipv4Range`].
pub struct Hosts {
    current: u64,
    end: u64,
}

impl Iterator for Hosts {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        if self.current >= self.end {
            return None;
        }
        let addr = Ipv4Addr::from(self.current as u32);
        self.current += 1;
        Some(addr)
    }
}

/// Addresses discovery never probes or reports: unspecified, limited
/// broadcast, multicast and link-local. Loopback is deliberately probe-able
/// so a local agent counts as a device.
pub fn is_invalid_address(addr: Ipv4Addr) -> bool {
    addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast() || addr.is_link_local()
}

/// The /24 networks the host's own interfaces sit in, used to seed
/// discovery when no explicit range is configured. Loopback and otherwise
/// invalid interface addresses are skipped.
pub fn local_interfaces() -> Result<Vec<Ipv4Range>> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    let mut ranges = Vec::new();
    for (name, addr) in interfaces {
        let IpAddr::V4(addr) = addr else { continue };
        if addr.is_loopback() || is_invalid_address(addr) {
            continue;
        }
        let range = Ipv4Range::enclosing(addr, 24)?;
        if !ranges.contains(&range) {
            log::debug!("[Discovery] local interface {} seeds {}", name, range);
            ranges.push(range);
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalizes_host_bits() {
        let range: Ipv4Range = "10.1.2.3/24".parse().expect("parses");
        assert_eq!(range.network(), Ipv4Addr::new(10, 1, 2, 0));
        assert_eq!(range.prefix(), 24);
        assert_eq!(range.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_parse_bare_address_is_slash_32() {
        let range: Ipv4Range = "192.168.0.7".parse().expect("parses");
        assert_eq!(range.prefix(), 32);
        let hosts: Vec<_> = range.hosts().collect();
        assert_eq!(hosts, vec![Ipv4Addr::new(192, 168, 0, 7)]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("10.0.0.0/33".parse::<Ipv4Range>().is_err());
        assert!("10.0.0/24".parse::<Ipv4Range>().is_err());
        assert!("hosts".parse::<Ipv4Range>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Range>().is_err());
    }

    #[test]
    fn test_hosts_skip_network_and_broadcast() {
        let range: Ipv4Range = "10.0.0.0/30".parse().expect("parses");
        let hosts: Vec<_> = range.hosts().collect();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );

        let pair: Ipv4Range = "10.0.0.4/31".parse().expect("parses");
        assert_eq!(pair.hosts().count(), 2);
    }

    #[test]
    fn test_slash_24_host_count() {
        let range: Ipv4Range = "172.16.5.0/24".parse().expect("parses");
        assert_eq!(range.hosts().count(), 254);
    }

    #[test]
    fn test_contains() {
        let range: Ipv4Range = "10.1.0.0/16".parse().expect("parses");
        assert!(range.contains(Ipv4Addr::new(10, 1, 200, 9)));
        assert!(!range.contains(Ipv4Addr::new(10, 2, 0, 1)));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(is_invalid_address(Ipv4Addr::UNSPECIFIED));
        assert!(is_invalid_address(Ipv4Addr::BROADCAST));
        assert!(is_invalid_address(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(is_invalid_address(Ipv4Addr::new(169, 254, 1, 1)));
        // loopback stays probe-able
        assert!(!is_invalid_address(Ipv4Addr::LOCALHOST));
        assert!(!is_invalid_address(Ipv4Addr::new(10, 0, 0, 1)));
    }
}
