// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! netmgr - script-extensible network management runtime.
//!
//! The crate has three pillars:
//!
//! - **Drivers** ([`driver`]): every backend implements the same
//!   Get/Put/Create/Delete contract over string parameters and is reached
//!   through the [`DriverRegistry`].
//! - **Coroutine bridge** ([`bridge`]): a [`ScriptDriver`] runs operations
//!   as coroutines in an embedded Lua interpreter; scripts call back into
//!   native drivers by yielding actions, so extension logic lives in
//!   scripts without giving up native I/O.
//! - **Discovery** ([`discovery`]): an SNMP flood-fill that probes seed
//!   ranges, enriches answering agents into device records and expands
//!   through the networks those devices report.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netmgr::{BridgeConfig, Driver, DriverRegistry, Params, ScriptDriver};
//!
//! fn main() -> netmgr::Result<()> {
//!     let registry = Arc::new(DriverRegistry::new());
//!     let bridge = ScriptDriver::new("core", BridgeConfig::from_env(), Arc::clone(&registry));
//!     bridge.start()?;
//!
//!     let mut params = Params::new();
//!     params.insert("schema".into(), "script".into());
//!     params.insert("script".into(), "return 'pong'".into());
//!     let res = bridge.get(&params)?;
//!     println!("{}", res.value());
//!
//!     bridge.stop();
//!     Ok(())
//! }
//! ```

/// Coroutine bridge between callers and the embedded script engine.
pub mod bridge;
/// Constants and `NETMGR_*` environment configuration.
pub mod config;
/// SNMP flood-fill network discovery.
pub mod discovery;
/// Driver contract, registry and the service worker primitive.
pub mod driver;
/// Shared error type.
pub mod error;
/// Probe codec and pinger sockets.
pub mod snmp;

pub use bridge::{Continuation, ExecStatus, FiberGauge, MethodTable, NativeMethod, ScriptDriver};
pub use config::BridgeConfig;
pub use discovery::{Device, Discoverer, DiscoveryParams, END_TOKEN, TIMEOUT_TOKEN};
pub use driver::registry::DriverRegistry;
pub use driver::service::Service;
pub use driver::{Driver, DriverResult, Params, ResultError, StubDriver};
pub use error::{Error, Result};

/// Crate version, as compiled.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
