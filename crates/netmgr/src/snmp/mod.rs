// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Minimal SNMP support for discovery probing.
//!
//! Only what a liveness probe needs: encoding a single-varbind GetRequest
//! and decoding enough of a reply to recover version and request id. Full
//! SNMP access goes through a dedicated driver, not this module.

pub mod codec;
pub mod pinger;

use std::str::FromStr;

use crate::error::Error;

/// SNMP protocol version as carried in the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnmpVersion {
    V1,
    #[default]
    V2c,
}

impl SnmpVersion {
    /// Wire value of the version field.
    pub fn wire(self) -> u8 {
        match self {
            SnmpVersion::V1 => 0,
            SnmpVersion::V2c => 1,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(SnmpVersion::V1),
            1 => Some(SnmpVersion::V2c),
            _ => None,
        }
    }
}

impl std::fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnmpVersion::V1 => write!(f, "v1"),
            SnmpVersion::V2c => write!(f, "v2c"),
        }
    }
}

impl FromStr for SnmpVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" | "1" => Ok(SnmpVersion::V1),
            "v2c" | "v2" | "2c" | "2" => Ok(SnmpVersion::V2c),
            other => Err(Error::InvalidParams(format!(
                "unknown snmp version '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_wire_round_trip() {
        for version in [SnmpVersion::V1, SnmpVersion::V2c] {
            assert_eq!(SnmpVersion::from_wire(version.wire()), Some(version));
        }
        assert_eq!(SnmpVersion::from_wire(3), None);
    }

    #[test]
    fn test_version_parse() {
        assert_eq!("v1".parse::<SnmpVersion>().unwrap(), SnmpVersion::V1);
        assert_eq!("2c".parse::<SnmpVersion>().unwrap(), SnmpVersion::V2c);
        assert!("v3".parse::<SnmpVersion>().is_err());
    }
}
