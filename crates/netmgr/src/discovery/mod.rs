// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! SNMP flood-fill network discovery.
//!
//! A run probes seed ranges, enriches every answering agent into a device
//! record through the `metrics` driver, then expands into the /24 networks
//! of the interfaces those devices report. Expansion repeats up to the
//! configured depth; a round ends when the reply stream stays idle for the
//! configured window. Already-scanned ranges and already-known addresses
//! are never probed twice.
//!
//! Consumers follow a run through [`Discoverer::read`]: device addresses
//! as they appear, then the `end` token.

pub mod iprange;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{
    DEFAULT_COMMUNITY, DEFAULT_DISCOVERY_DEPTH, DEFAULT_DISCOVERY_TIMEOUT_SECS, DEFAULT_POLLERS,
    SNMP_PORT,
};
use crate::driver::registry::DriverRegistry;
use crate::driver::{Driver, Params};
use crate::error::{Error, Result};
use crate::snmp::pinger::{PingReply, PingerPool};
use crate::snmp::SnmpVersion;
use iprange::{is_invalid_address, local_interfaces, Ipv4Range};

/// Final token of a completed run.
pub const END_TOKEN: &str = "end";
/// Token for a read window that passed without news.
pub const TIMEOUT_TOKEN: &str = "timeout";

/// A discovered device: a JSON object keyed by metric aliases plus the
/// `address` and `$access_param` bookkeeping fields.
pub type Device = serde_json::Map<String, JsonValue>;

/// Metric names fetched per device and the device keys they land under.
const DEVICE_METRICS: &[(&str, &str)] = &[
    ("sys.oid", "oid"),
    ("sys.descr", "description"),
    ("sys.type", "catalog"),
    ("sys.services", "services"),
    ("sys.name", "name"),
    ("sys.location", "location"),
    ("interfaceDescr", "$interface"),
    ("ipAddress", "$address"),
];

/// Tuning of one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryParams {
    /// Idle window closing a round when no reply arrives.
    pub timeout: Duration,
    /// Flood-fill depth: 1 scans only the seeds.
    pub depth: u32,
    /// Seed ranges. Empty plus `read_local` falls back to the host's own
    /// interface networks.
    pub ranges: Vec<Ipv4Range>,
    /// Communities to probe with; one socket each.
    pub communities: Vec<String>,
    pub read_local: bool,
    /// Agent port to probe, normally 161.
    pub probe_port: u16,
}

impl Default for DiscoveryParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_DISCOVERY_TIMEOUT_SECS),
            depth: DEFAULT_DISCOVERY_DEPTH,
            ranges: Vec::new(),
            communities: vec![DEFAULT_COMMUNITY.to_owned()],
            read_local: true,
            probe_port: SNMP_PORT,
        }
    }
}

impl DiscoveryParams {
    /// Build run parameters from a driver-style string mapping.
    pub fn from_params(params: &Params) -> Result<Self> {
        let mut out = Self::default();
        if let Some(v) = params.get("timeout") {
            let secs: u64 = v
                .parse()
                .map_err(|_| Error::InvalidParams(format!("timeout '{}'", v)))?;
            out.timeout = Duration::from_secs(secs);
        }
        if let Some(v) = params.get("depth") {
            out.depth = v
                .parse()
                .map_err(|_| Error::InvalidParams(format!("depth '{}'", v)))?;
        }
        if let Some(v) = params.get("port") {
            out.probe_port = v
                .parse()
                .map_err(|_| Error::InvalidParams(format!("port '{}'", v)))?;
        }
        if let Some(v) = params.get("ranges") {
            out.ranges = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().parse())
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(v) = params.get("communities") {
            out.communities = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_owned())
                .collect();
        }
        if let Some(v) = params.get("read_local") {
            out.read_local = v == "true" || v == "1";
        }
        // "public" is always probed, whatever the operator configured.
        if !out.communities.iter().any(|c| c == DEFAULT_COMMUNITY) {
            out.communities.push(DEFAULT_COMMUNITY.to_owned());
        }
        Ok(out)
    }
}

enum Control {
    /// A reply arrived that is not an SNMP message; the run aborts.
    PingFailed(String),
}

/// One discovery run: probe sockets, reply pollers and the flood-fill
/// serve loop.
pub struct Discoverer {
    params: DiscoveryParams,
    pinger: Arc<PingerPool>,
    metrics: Arc<dyn Driver>,
    devices: DashMap<String, Device>,
    /// Interface address -> owning device address.
    managed: DashMap<String, String>,
    scanned: Mutex<HashSet<String>>,
    completed: AtomicBool,
    events_tx: Sender<String>,
    events_rx: Receiver<String>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Discoverer {
    /// Kick off a run. Requires a `metrics` driver in the registry for
    /// device enrichment.
    pub fn start(params: DiscoveryParams, registry: &DriverRegistry) -> Result<Arc<Self>> {
        let metrics = registry.require("metrics")?;

        let pinger = Arc::new(PingerPool::new());
        let any: SocketAddr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        for community in &params.communities {
            pinger.listen(any, SnmpVersion::V2c, community)?;
        }

        let (events_tx, events_rx) = bounded(64);
        let (dev_tx, dev_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();

        let discoverer = Arc::new(Self {
            params,
            pinger,
            metrics,
            devices: DashMap::new(),
            managed: DashMap::new(),
            scanned: Mutex::new(HashSet::new()),
            completed: AtomicBool::new(false),
            events_tx,
            events_rx,
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = discoverer.threads.lock();
        for n in 0..DEFAULT_POLLERS {
            let this = Arc::clone(&discoverer);
            let dev_tx = dev_tx.clone();
            let ctrl_tx = ctrl_tx.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("disco-poll-{}", n))
                    .spawn(move || this.poll_replies(&dev_tx, &ctrl_tx))?,
            );
        }
        drop((dev_tx, ctrl_tx));

        let this = Arc::clone(&discoverer);
        threads.push(
            std::thread::Builder::new()
                .name("disco-serve".to_owned())
                .spawn(move || this.serve(&dev_rx, &ctrl_rx))?,
        );
        drop(threads);

        Ok(discoverer)
    }

    /// Next event of the run: a device address, [`TIMEOUT_TOKEN`] when the
    /// window passed quietly, [`END_TOKEN`] once the run is over.
    pub fn read(&self, timeout: Duration) -> String {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                if self.completed.load(Ordering::Acquire) {
                    END_TOKEN.to_owned()
                } else {
                    TIMEOUT_TOKEN.to_owned()
                }
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Snapshot of everything found so far.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Abort the run (if still going) and join every thread.
    pub fn stop(&self) {
        self.pinger.close();
        let current = std::thread::current().id();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            // A worker dropping the last handle must not join itself.
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                log::warn!("[Discovery] worker thread panicked");
            }
        }
    }

    // ===== reply pollers =====

    fn poll_replies(&self, dev_tx: &Sender<Device>, ctrl_tx: &Sender<Control>) {
        for reply in self.pinger.replies() {
            if let Some(err) = reply.error {
                let _ = ctrl_tx.send(Control::PingFailed(err));
                continue;
            }
            let address = reply.addr.ip().to_string();
            if !self.is_unknown(&address) {
                continue;
            }
            let mut device = Self::access_record(&reply);
            self.init_device(&mut device, &reply);

            // Claim the interface addresses so other pollers skip them.
            for ip in interface_addresses(&device) {
                self.managed.insert(ip.to_string(), address.clone());
            }
            if self.devices.insert(address.clone(), device.clone()).is_some() {
                continue; // raced with another poller
            }
            log::info!("[Discovery] found device {}", address);
            if self.events_tx.try_send(address).is_err() {
                log::debug!("[Discovery] event channel full, device not announced");
            }
            let _ = dev_tx.send(device);
        }
    }

    /// Skeleton device record carrying the access parameters that answered.
    fn access_record(reply: &PingReply) -> Device {
        let address = reply.addr.ip().to_string();
        let mut device = Device::new();
        device.insert("address".to_owned(), json!(address));
        device.insert(
            "$access_param".to_owned(),
            json!([{
                "type": "snmp_param",
                "address": address,
                "port": reply.addr.port(),
                "version": reply.version.to_string(),
                "community": reply.community,
            }]),
        );
        device
    }

    /// Fetch the standard metric set for a fresh device. A failing metric
    /// is logged and left out; the device is still reported.
    fn init_device(&self, device: &mut Device, reply: &PingReply) {
        let mut params = Params::new();
        params.insert("address".to_owned(), reply.addr.ip().to_string());
        params.insert("port".to_owned(), reply.addr.port().to_string());
        params.insert("version".to_owned(), reply.version.to_string());
        params.insert("community".to_owned(), reply.community.clone());

        for (metric, key) in DEVICE_METRICS {
            params.insert("metric".to_owned(), (*metric).to_owned());
            match self.metrics.get(&params) {
                Ok(res) if !res.has_error() => {
                    device.insert((*key).to_owned(), res.into_value());
                }
                Ok(res) => log::debug!(
                    "[Discovery] metric {} of {} failed: {}",
                    metric,
                    reply.addr,
                    res.error_message()
                ),
                Err(e) => {
                    log::debug!("[Discovery] metric {} of {} failed: {}", metric, reply.addr, e);
                }
            }
        }
    }

    fn is_unknown(&self, address: &str) -> bool {
        !self.devices.contains_key(address) && !self.managed.contains_key(address)
    }

    // ===== serve loop =====

    fn serve(&self, dev_rx: &Receiver<Device>, ctrl_rx: &Receiver<Control>) {
        let mut pending = self.params.ranges.clone();
        if pending.is_empty() && self.params.read_local {
            match local_interfaces() {
                Ok(ranges) => pending = ranges,
                Err(e) => log::warn!("[Discovery] cannot read local interfaces: {}", e),
            }
        }

        'rounds: for round in 1..=self.params.depth {
            let ranges: Vec<_> = pending
                .drain(..)
                .filter(|range| self.mark_scanned(range))
                .collect();
            if ranges.is_empty() {
                break;
            }
            log::info!(
                "[Discovery] round {}: probing {} range(s)",
                round,
                ranges.len()
            );
            for range in &ranges {
                self.probe_range(range);
            }

            // Collect replies until the stream stays idle for the window.
            loop {
                crossbeam::select! {
                    recv(ctrl_rx) -> msg => match msg {
                        Ok(Control::PingFailed(err)) => {
                            log::error!("[Discovery] probing failed: {}", err);
                            break 'rounds;
                        }
                        Err(_) => break 'rounds,
                    },
                    recv(dev_rx) -> msg => match msg {
                        Ok(device) => {
                            for ip in interface_addresses(&device) {
                                match Ipv4Range::enclosing(ip, 24) {
                                    Ok(range) => {
                                        if !self.is_scanned(&range) && !pending.contains(&range) {
                                            pending.push(range);
                                        }
                                    }
                                    Err(e) => log::debug!("[Discovery] bad interface address: {}", e),
                                }
                            }
                        }
                        Err(_) => break 'rounds,
                    },
                    default(self.params.timeout) => break,
                }
            }

            if pending.is_empty() {
                break;
            }
        }

        self.completed.store(true, Ordering::Release);
        let _ = self.events_tx.try_send(END_TOKEN.to_owned());
        log::info!(
            "[Discovery] run complete, {} device(s) found",
            self.devices.len()
        );
        self.pinger.close();
    }

    fn probe_range(&self, range: &Ipv4Range) {
        for host in range.hosts() {
            if is_invalid_address(host) {
                continue;
            }
            let target = SocketAddr::from((host, self.params.probe_port));
            if let Err(e) = self.pinger.send_all(target) {
                log::debug!("[Discovery] probe of {} failed: {}", target, e);
            }
        }
    }

    /// Mark a range as scanned; `false` means it already was.
    fn mark_scanned(&self, range: &Ipv4Range) -> bool {
        self.scanned.lock().insert(range.to_string())
    }

    fn is_scanned(&self, range: &Ipv4Range) -> bool {
        self.scanned.lock().contains(&range.to_string())
    }
}

impl Drop for Discoverer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Interface addresses a device reported under `$address`.
fn interface_addresses(device: &Device) -> Vec<Ipv4Addr> {
    let Some(JsonValue::Array(rows)) = device.get("$address") else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| row.get("address"))
        .filter_map(JsonValue::as_str)
        .filter_map(|s| s.parse().ok())
        .filter(|ip| !is_invalid_address(*ip))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StubDriver;
    use std::net::UdpSocket;

    /// UDP agent answering each probe by echoing it back; an echoed
    /// GetRequest decodes like a real reply.
    fn spawn_agent(echo: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("agent binds");
        let addr = socket.local_addr().expect("agent addr");
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while let Ok((len, raddr)) = socket.recv_from(&mut buf) {
                let answer: &[u8] = if echo { &buf[..len] } else { b"junk" };
                if socket.send_to(answer, raddr).is_err() {
                    break;
                }
            }
        });
        addr
    }

    fn run_params(agent: SocketAddr) -> DiscoveryParams {
        DiscoveryParams {
            timeout: Duration::from_millis(300),
            depth: 1,
            ranges: vec!["127.0.0.1/32".parse().expect("range")],
            communities: vec!["public".to_owned()],
            read_local: false,
            probe_port: agent.port(),
        }
    }

    #[test]
    fn test_discovers_local_agent() {
        let agent = spawn_agent(true);
        let registry = DriverRegistry::new();
        registry
            .register("metrics", Arc::new(StubDriver::answering(json!("probed"))))
            .expect("register metrics");

        let disco = Discoverer::start(run_params(agent), &registry).expect("run starts");

        let first = disco.read(Duration::from_secs(3));
        assert_eq!(first, "127.0.0.1");

        // Drain until the run reports completion.
        let mut saw_end = false;
        for _ in 0..20 {
            if disco.read(Duration::from_millis(500)) == END_TOKEN {
                saw_end = true;
                break;
            }
        }
        assert!(saw_end, "run must complete");
        assert!(disco.is_completed());

        let devices = disco.devices();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.get("address"), Some(&json!("127.0.0.1")));
        assert_eq!(device.get("description"), Some(&json!("probed")));
        let access = device
            .get("$access_param")
            .and_then(JsonValue::as_array)
            .expect("access params present");
        assert_eq!(access[0].get("community"), Some(&json!("public")));
        disco.stop();
    }

    #[test]
    fn test_garbage_reply_aborts_run() {
        let agent = spawn_agent(false);
        let registry = DriverRegistry::new();
        registry
            .register("metrics", Arc::new(StubDriver::default()))
            .expect("register metrics");

        let disco = Discoverer::start(run_params(agent), &registry).expect("run starts");
        let mut saw_end = false;
        for _ in 0..20 {
            if disco.read(Duration::from_millis(500)) == END_TOKEN {
                saw_end = true;
                break;
            }
        }
        assert!(saw_end, "aborted run still completes");
        assert_eq!(disco.device_count(), 0);
        disco.stop();
    }

    #[test]
    fn test_requires_metrics_driver() {
        let registry = DriverRegistry::new();
        let err = match Discoverer::start(DiscoveryParams::default(), &registry) {
            Err(err) => err,
            Ok(_) => panic!("a run without a metrics driver must not start"),
        };
        assert!(matches!(err, Error::NotFound(name) if name == "metrics"));
    }

    #[test]
    fn test_params_from_string_map() {
        let mut raw = Params::new();
        raw.insert("timeout".into(), "3".into());
        raw.insert("depth".into(), "4".into());
        raw.insert("ranges".into(), "10.0.0.0/24, 10.0.1.0/24".into());
        raw.insert("communities".into(), "public,private".into());
        raw.insert("read_local".into(), "false".into());
        raw.insert("port".into(), "1161".into());

        let params = DiscoveryParams::from_params(&raw).expect("parses");
        assert_eq!(params.timeout, Duration::from_secs(3));
        assert_eq!(params.depth, 4);
        assert_eq!(params.ranges.len(), 2);
        assert_eq!(params.communities, vec!["public", "private"]);
        assert!(!params.read_local);
        assert_eq!(params.probe_port, 1161);

        assert!(DiscoveryParams::from_params(&{
            let mut bad = Params::new();
            bad.insert("depth".into(), "many".into());
            bad
        })
        .is_err());
    }

    #[test]
    fn test_known_devices_and_interfaces_are_not_unknown() {
        let registry = DriverRegistry::new();
        registry
            .register("metrics", Arc::new(StubDriver::default()))
            .expect("register metrics");
        let params = DiscoveryParams {
            timeout: Duration::from_millis(50),
            depth: 1,
            ranges: Vec::new(),
            communities: vec!["public".to_owned()],
            read_local: false,
            probe_port: 1161,
        };
        let disco = Discoverer::start(params, &registry).expect("run starts");

        assert!(disco.is_unknown("10.0.0.9"));
        disco.devices.insert("10.0.0.9".to_owned(), Device::new());
        disco
            .managed
            .insert("10.0.0.77".to_owned(), "10.0.0.9".to_owned());

        // Device addresses and their interface addresses are both known.
        assert!(!disco.is_unknown("10.0.0.9"));
        assert!(!disco.is_unknown("10.0.0.77"));
        assert!(disco.is_unknown("10.0.0.78"));
        disco.stop();
    }

    #[test]
    fn test_ranges_are_scanned_once() {
        let registry = DriverRegistry::new();
        registry
            .register("metrics", Arc::new(StubDriver::default()))
            .expect("register metrics");
        let params = DiscoveryParams {
            timeout: Duration::from_millis(50),
            depth: 1,
            ranges: Vec::new(),
            communities: vec!["public".to_owned()],
            read_local: false,
            probe_port: 1161,
        };
        let disco = Discoverer::start(params, &registry).expect("run starts");
        let range: Ipv4Range = "10.9.0.0/24".parse().expect("range");
        assert!(disco.mark_scanned(&range));
        assert!(!disco.mark_scanned(&range));
        assert!(disco.is_scanned(&range));
        disco.stop();
    }
}
