// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Error types shared by the driver runtime, the coroutine bridge and the
//! discovery engine.

/// Errors returned by netmgr operations.
///
/// # Example
///
/// ```rust,no_run
/// use netmgr::{DriverRegistry, Error};
///
/// let registry = DriverRegistry::new();
/// match registry.start("snmp") {
///     Err(Error::NotFound(name)) => println!("no such driver: {}", name),
///     Err(e) => println!("other error: {}", e),
///     Ok(()) => println!("started"),
/// }
/// ```
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Registry / Lifecycle Errors
    // ========================================================================
    /// Named driver is not registered.
    NotFound(String),
    /// A driver with this name is already registered.
    AlreadyRegistered(String),
    /// Driver was started while already running.
    AlreadyStarted(String),
    /// Operation requires a started driver.
    NotStarted(String),
    /// Request parameters are missing or malformed.
    InvalidParams(String),

    // ========================================================================
    // Service / Bridge Errors
    // ========================================================================
    /// The service worker thread is gone (closed or crashed).
    ServiceClosed(String),
    /// A `safely_call` deadline expired before the worker replied.
    CallTimeout(String),
    /// A worker closure panicked; the panic payload is carried as text.
    Panicked(String),
    /// The embedded script failed at runtime (compile error, runtime error,
    /// or an error value returned by the script).
    Script(String),
    /// The interpreter yielded something the resume/yield protocol does not
    /// allow (missing action name, wrong type, missing coroutine handle).
    Protocol(String),
    /// A previous invocation timed out and abandoned interpreter state; the
    /// bridge refuses further work until restarted.
    BridgePoisoned,

    // ========================================================================
    // Network / Codec Errors
    // ========================================================================
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// SNMP BER encoding or decoding failed.
    Codec(String),
    /// Address or CIDR range could not be parsed.
    InvalidAddress(String),
    /// The pinger pool was closed while an operation was in flight.
    PingerClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Registry / lifecycle
            Error::NotFound(name) => write!(f, "driver '{}' is not exists", name),
            Error::AlreadyRegistered(name) => write!(f, "driver '{}' is already registered", name),
            Error::AlreadyStarted(name) => write!(f, "driver '{}' is already started", name),
            Error::NotStarted(name) => write!(f, "driver '{}' is not started", name),
            Error::InvalidParams(msg) => write!(f, "invalid params: {}", msg),
            // Service / bridge
            Error::ServiceClosed(name) => write!(f, "service '{}' is closed", name),
            Error::CallTimeout(name) => write!(f, "call into service '{}' timed out", name),
            Error::Panicked(msg) => write!(f, "worker closure panicked: {}", msg),
            Error::Script(msg) => write!(f, "{}", msg),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::BridgePoisoned => {
                write!(f, "bridge poisoned by a timed-out invocation, restart required")
            }
            // Network / codec
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Codec(msg) => write!(f, "codec error: {}", msg),
            Error::InvalidAddress(addr) => write!(f, "invalid address: {}", addr),
            Error::PingerClosed => write!(f, "pinger pool is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<mlua::Error> for Error {
    fn from(e: mlua::Error) -> Self {
        Error::Script(e.to_string())
    }
}

/// Convenient alias for API results using the public [`Error`] type.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_the_driver() {
        let err = Error::NotFound("snmp".into());
        assert!(err.to_string().contains("'snmp'"));
    }

    #[test]
    fn test_io_error_keeps_source() {
        use std::error::Error as _;
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_script_error_is_verbatim() {
        let err = Error::Script("unsupport action 'frobnicate'".into());
        assert_eq!(err.to_string(), "unsupport action 'frobnicate'");
    }
}
