// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Concurrent driver registry.
//!
//! Process-wide name -> driver map. Registration rejects duplicates,
//! `connect` hands out a shared handle, and the lifecycle helpers fan
//! Start/Stop out to every registered driver.

use dashmap::DashMap;
use std::sync::Arc;

use crate::driver::Driver;
use crate::error::{Error, Result};

/// Name-indexed driver table shared across the process.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under `name`. Names are unique; registering a
    /// duplicate is rejected rather than silently replacing the holder.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.drivers.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(name.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(driver);
                log::debug!("[Registry] registered driver '{}'", name);
                Ok(())
            }
        }
    }

    /// Remove a driver, returning the handle if one was registered. The
    /// driver is not stopped; callers owning its lifecycle do that.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.remove(name).map(|(_, drv)| drv)
    }

    /// Look up a driver by name.
    pub fn connect(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Like [`connect`](Self::connect) but with a typed error for callers
    /// that treat a missing driver as a failure.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.connect(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Names of all registered drivers, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.drivers.iter().map(|e| e.key().clone()).collect()
    }

    /// Start one driver by name.
    pub fn start(&self, name: &str) -> Result<()> {
        self.require(name)?.start()
    }

    /// Stop one driver by name. Missing drivers are ignored; stop is
    /// best-effort by contract.
    pub fn stop(&self, name: &str) {
        if let Some(drv) = self.connect(name) {
            drv.stop();
        }
    }

    /// Start every registered driver. Stops at the first failure and
    /// reports it; drivers started so far stay up.
    pub fn start_all(&self) -> Result<()> {
        for entry in self.drivers.iter() {
            entry.value().start().map_err(|e| {
                log::error!("[Registry] start of '{}' failed: {}", entry.key(), e);
                e
            })?;
        }
        Ok(())
    }

    /// Stop every registered driver.
    pub fn stop_all(&self) {
        for entry in self.drivers.iter() {
            entry.value().stop();
        }
    }

    /// Stop and drop every registered driver.
    pub fn reset(&self) {
        self.stop_all();
        self.drivers.clear();
    }
}
