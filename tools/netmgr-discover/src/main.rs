// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! Command-line SNMP discovery runner.
//!
//! Probes the given ranges (or the host's own networks), follows the run
//! on stderr and prints the discovered devices as JSON on stdout.

use log::{LevelFilter, Metadata, Record};
use netmgr::driver::NOT_IMPLEMENTED;
use netmgr::{
    Discoverer, DiscoveryParams, Driver, DriverRegistry, DriverResult, Params, END_TOKEN,
    TIMEOUT_TOKEN,
};
use std::time::Duration;

/// Enrichment backend of last resort: every metric is "not collected",
/// so devices carry only their address and access parameters.
struct NullMetrics;

impl Driver for NullMetrics {
    fn get(&self, _params: &Params) -> netmgr::Result<DriverResult> {
        Ok(DriverResult::error(NOT_IMPLEMENTED, "metric not collected"))
    }
    fn put(&self, _params: &Params) -> netmgr::Result<DriverResult> {
        Ok(DriverResult::error(NOT_IMPLEMENTED, "metric not collected"))
    }
    fn create(&self, _params: &Params) -> netmgr::Result<DriverResult> {
        Ok(DriverResult::error(NOT_IMPLEMENTED, "metric not collected"))
    }
    fn delete(&self, _params: &Params) -> netmgr::Result<DriverResult> {
        Ok(DriverResult::error(NOT_IMPLEMENTED, "metric not collected"))
    }
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logger() {
    let level = match std::env::var("NETMGR_LOG").as_deref() {
        Ok("debug") => LevelFilter::Debug,
        Ok("warn") => LevelFilter::Warn,
        Ok("error") => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn usage() -> ! {
    eprintln!("Usage: netmgr-discover [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --ranges CIDR[,CIDR...]       seed ranges (default: local networks)");
    eprintln!("  --communities NAME[,NAME...]  SNMP communities (default: public)");
    eprintln!("  --depth N                     flood-fill depth (default: 2)");
    eprintln!("  --timeout SECS                idle window per round (default: 10)");
    eprintln!("  --port PORT                   agent port to probe (default: 161)");
    std::process::exit(2);
}

fn parse_args() -> Params {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut params = Params::new();
    let mut i = 0;
    while i < args.len() {
        let key = match args[i].as_str() {
            "--ranges" => "ranges",
            "--communities" => "communities",
            "--depth" => "depth",
            "--timeout" => "timeout",
            "--port" => "port",
            "-h" | "--help" => usage(),
            other => {
                eprintln!("unknown option '{}'", other);
                usage();
            }
        };
        let Some(value) = args.get(i + 1) else {
            eprintln!("option '{}' needs a value", args[i]);
            usage();
        };
        params.insert(key.to_owned(), value.clone());
        i += 2;
    }
    params
}

fn main() {
    init_logger();

    let raw = parse_args();
    let params = match DiscoveryParams::from_params(&raw) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("invalid options: {}", e);
            std::process::exit(2);
        }
    };

    let registry = DriverRegistry::new();
    if let Err(e) = registry.register("metrics", std::sync::Arc::new(NullMetrics)) {
        eprintln!("cannot set up registry: {}", e);
        std::process::exit(1);
    }

    let run = match Discoverer::start(params, &registry) {
        Ok(run) => run,
        Err(e) => {
            eprintln!("discovery failed to start: {}", e);
            std::process::exit(1);
        }
    };

    loop {
        let event = run.read(Duration::from_secs(1));
        match event.as_str() {
            END_TOKEN => break,
            TIMEOUT_TOKEN => {}
            address => log::info!("device {}", address),
        }
    }

    let devices = run.devices();
    run.stop();

    match serde_json::to_string_pretty(&devices) {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("cannot render devices: {}", e);
            std::process::exit(1);
        }
    }
    log::info!("{} device(s) found", devices.len());
}
