// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! The uniform driver capability contract.
//!
//! Every backend - SNMP, HTTP datastore client, pinger, bridged script
//! engines - is addressed through the same four operations over a string
//! parameter mapping. The [`DriverRegistry`](crate::DriverRegistry) holds
//! drivers by name and is the single point of indirection for callers and
//! for scripts.

pub mod registry;
pub mod service;

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::Result;

/// String parameter mapping passed to every driver operation.
pub type Params = HashMap<String, String>;

// Well-known result error codes, aligned with HTTP status semantics.
pub const BAD_REQUEST: i32 = 400;
pub const NOT_FOUND: i32 = 404;
pub const INTERNAL_ERROR: i32 = 500;
pub const NOT_IMPLEMENTED: i32 = 501;

/// Error payload carried inside a [`DriverResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultError {
    pub code: i32,
    pub message: String,
}

/// Outcome of one driver operation.
///
/// Carries a dynamic value, an optional application-level error, optional
/// warnings, an affected-row count (`-1` when not applicable) and the
/// creation timestamp. Backend transport failures are reported through the
/// outer [`Result`](crate::Result) instead.
#[derive(Debug, Clone)]
pub struct DriverResult {
    value: JsonValue,
    error: Option<ResultError>,
    warnings: Option<JsonValue>,
    effected: i64,
    created_at: SystemTime,
}

impl DriverResult {
    /// Successful result wrapping `value`.
    pub fn ok(value: JsonValue) -> Self {
        Self {
            value,
            error: None,
            warnings: None,
            effected: -1,
            created_at: SystemTime::now(),
        }
    }

    /// Failed result with an error code and message.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        let mut res = Self::ok(JsonValue::Null);
        res.error = Some(ResultError {
            code,
            message: message.into(),
        });
        res
    }

    pub fn with_error(mut self, code: i32, message: impl Into<String>) -> Self {
        self.error = Some(ResultError {
            code,
            message: message.into(),
        });
        self
    }

    pub fn with_warnings(mut self, warnings: JsonValue) -> Self {
        self.warnings = Some(warnings);
        self
    }

    pub fn with_effected(mut self, effected: i64) -> Self {
        self.effected = effected;
        self
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_code(&self) -> i32 {
        self.error.as_ref().map_or(-1, |e| e.code)
    }

    pub fn error_message(&self) -> &str {
        self.error.as_ref().map_or("", |e| e.message.as_str())
    }

    pub fn value(&self) -> &JsonValue {
        &self.value
    }

    /// Consume the result, keeping only its value.
    pub fn into_value(self) -> JsonValue {
        self.value
    }

    pub fn warnings(&self) -> Option<&JsonValue> {
        self.warnings.as_ref()
    }

    pub fn effected(&self) -> i64 {
        self.effected
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    // Typed accessors over the dynamic value.

    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Polymorphic backend capability: Get/Put/Create/Delete over a string
/// parameter mapping, plus an optional Start/Stop lifecycle.
///
/// Implementations are native (SNMP, HTTP, pinger) or bridged
/// (interpreter-backed). Drivers must be callable from multiple threads.
pub trait Driver: Send + Sync {
    fn get(&self, params: &Params) -> Result<DriverResult>;
    fn put(&self, params: &Params) -> Result<DriverResult>;
    fn create(&self, params: &Params) -> Result<DriverResult>;
    fn delete(&self, params: &Params) -> Result<DriverResult>;

    /// Bring the driver up. Default is a no-op for stateless drivers.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Tear the driver down. Must be safe to call when never started and
    /// safe to call twice.
    fn stop(&self) {}
}

/// Fixed-answer driver used by tests and as a placeholder backend.
#[derive(Debug, Default)]
pub struct StubDriver {
    pub get_value: JsonValue,
    pub put_value: JsonValue,
    pub create_value: JsonValue,
    pub delete_value: JsonValue,
    pub error_code: i32,
    pub error_message: String,
}

impl StubDriver {
    /// Stub answering every operation with the same value.
    pub fn answering(value: JsonValue) -> Self {
        Self {
            get_value: value.clone(),
            put_value: value.clone(),
            create_value: value.clone(),
            delete_value: value,
            ..Self::default()
        }
    }

    fn reply(&self, value: &JsonValue) -> Result<DriverResult> {
        let mut res = DriverResult::ok(value.clone());
        if !self.error_message.is_empty() || self.error_code != 0 {
            res = res.with_error(self.error_code, self.error_message.clone());
        }
        Ok(res)
    }
}

impl Driver for StubDriver {
    fn get(&self, _params: &Params) -> Result<DriverResult> {
        self.reply(&self.get_value)
    }

    fn put(&self, _params: &Params) -> Result<DriverResult> {
        self.reply(&self.put_value)
    }

    fn create(&self, _params: &Params) -> Result<DriverResult> {
        self.reply(&self.create_value)
    }

    fn delete(&self, _params: &Params) -> Result<DriverResult> {
        self.reply(&self.delete_value)
    }
}
