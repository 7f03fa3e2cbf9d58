// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Global configuration - constants and `NETMGR_*` environment overrides.
//!
//! This module centralizes the tunables of the runtime. Compile-time defaults
//! live here as constants; anything an operator may want to override at
//! process start reads a `NETMGR_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

// =======================================================================
// SNMP probing
// =======================================================================

/// Standard SNMP agent port (IANA).
pub const SNMP_PORT: u16 = 161;

/// OID sent with every discovery probe: sysObjectID (`SNMPv2-MIB`).
///
/// Any SNMP agent answers this, which is all a liveness probe needs.
pub const PROBE_OID: &str = "1.3.6.1.2.1.1.2.0";

/// Community used when the operator configures none.
pub const DEFAULT_COMMUNITY: &str = "public";

/// Capacity of the shared pinger reply channel.
pub const DEFAULT_REPLY_CAPACITY: usize = 10_000;

/// Poll interval of a pinger receive loop; bounds how long `close()` waits
/// for a receiver thread to notice the shutdown flag.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =======================================================================
// Discovery
// =======================================================================

/// Idle window (seconds) ending a discovery round when no device arrives.
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 10;

/// Default breadth limit of the discovery flood-fill.
pub const DEFAULT_DISCOVERY_DEPTH: u32 = 2;

/// Number of threads polling the pinger reply channel.
pub const DEFAULT_POLLERS: usize = 5;

// =======================================================================
// Coroutine bridge
// =======================================================================

/// Soft budget for one bridge invocation, decremented across sub-steps.
pub const DEFAULT_INVOKE_TIMEOUT_SECS: u64 = 300;

/// Init script file name looked up in the working directory when
/// `NETMGR_INIT_SCRIPT` is not set.
pub const DEFAULT_INIT_SCRIPT_NAME: &str = "core.lua";

/// Runtime knobs of one [`ScriptDriver`](crate::ScriptDriver) instance.
///
/// Defaults come from the constants above; [`BridgeConfig::from_env`] applies
/// `NETMGR_INIT_SCRIPT`, `NETMGR_MODULE_PATH` and
/// `NETMGR_INVOKE_TIMEOUT_SECS` on top.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Explicit init script path; when `None` the default file name is tried
    /// in the working directory and the embedded script is the fallback.
    pub init_script: Option<PathBuf>,
    /// Extra directory appended to the interpreter's `package.path` so
    /// operators can drop extension modules next to the process.
    pub module_path: Option<String>,
    /// Soft per-invocation deadline.
    pub invoke_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            init_script: None,
            module_path: None,
            invoke_timeout: Duration::from_secs(DEFAULT_INVOKE_TIMEOUT_SECS),
        }
    }
}

impl BridgeConfig {
    /// Build a config from `NETMGR_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(path) = std::env::var("NETMGR_INIT_SCRIPT") {
            if !path.is_empty() {
                cfg.init_script = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("NETMGR_MODULE_PATH") {
            if !path.is_empty() {
                cfg.module_path = Some(path);
            }
        }
        if let Ok(secs) = std::env::var("NETMGR_INVOKE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                cfg.invoke_timeout = Duration::from_secs(secs);
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = BridgeConfig::default();
        assert!(cfg.init_script.is_none());
        assert_eq!(cfg.invoke_timeout, Duration::from_secs(300));
    }
}
