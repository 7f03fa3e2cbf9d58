// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! UDP probe sockets feeding one shared reply channel.
//!
//! A [`PingerPool`] opens one socket per community, each with its own
//! receiver thread. Threads poll with a short read timeout so they notice
//! the shutdown flag; every reply, decodable or not, lands on the shared
//! bounded channel. Senders never block: when consumers fall behind the
//! reply is dropped, a probe is cheap to repeat.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{DEFAULT_REPLY_CAPACITY, PROBE_OID, RECV_POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::snmp::codec::{decode_header, encode_get};
use crate::snmp::SnmpVersion;

/// One answer (or decode failure) from a probed address.
#[derive(Debug, Clone)]
pub struct PingReply {
    pub addr: SocketAddr,
    pub version: SnmpVersion,
    pub community: String,
    pub error: Option<String>,
}

struct PingerSocket {
    socket: Arc<UdpSocket>,
    version: SnmpVersion,
    community: String,
    request_id: AtomicI32,
}

/// Pool of probe sockets with a shared reply channel.
pub struct PingerPool {
    sockets: Mutex<Vec<Arc<PingerSocket>>>,
    reply_tx: Mutex<Option<Sender<PingReply>>>,
    reply_rx: Receiver<PingReply>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl PingerPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLY_CAPACITY)
    }

    /// Pool with an explicit reply channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (reply_tx, reply_rx) = bounded(capacity);
        Self {
            sockets: Mutex::new(Vec::new()),
            reply_tx: Mutex::new(Some(reply_tx)),
            reply_rx,
            workers: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Open a probe socket bound to `laddr` and start its receiver thread.
    /// Returns the socket's index for use with [`send`](Self::send).
    pub fn listen(
        &self,
        laddr: SocketAddr,
        version: SnmpVersion,
        community: &str,
    ) -> Result<usize> {
        let tx = self
            .reply_tx
            .lock()
            .as_ref()
            .cloned()
            .ok_or(Error::PingerClosed)?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&laddr.into())?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let socket: Arc<UdpSocket> = Arc::new(socket.into());

        let entry = Arc::new(PingerSocket {
            socket: Arc::clone(&socket),
            version,
            community: community.to_owned(),
            request_id: AtomicI32::new(0),
        });

        let running = Arc::clone(&self.running);
        let recv_community = community.to_owned();
        let worker = std::thread::Builder::new()
            .name(format!("pinger-{}", community))
            .spawn(move || {
                let mut buf = [0u8; 4096];
                while running.load(Ordering::Acquire) {
                    let (len, raddr) = match socket.recv_from(&mut buf) {
                        Ok(pair) => pair,
                        Err(e) => {
                            match e.kind() {
                                std::io::ErrorKind::WouldBlock
                                | std::io::ErrorKind::TimedOut
                                // ICMP port-unreachable surfacing on the socket
                                | std::io::ErrorKind::ConnectionRefused => {}
                                kind => log::debug!("[Pinger] recv failed: {:?}", kind),
                            }
                            continue;
                        }
                    };
                    let reply = match decode_header(&buf[..len]) {
                        Ok(header) => PingReply {
                            addr: raddr,
                            version: header.version,
                            community: recv_community.clone(),
                            error: None,
                        },
                        Err(e) => PingReply {
                            addr: raddr,
                            version,
                            community: recv_community.clone(),
                            error: Some(e.to_string()),
                        },
                    };
                    match tx.try_send(reply) {
                        Ok(()) => {}
                        Err(TrySendError::Full(reply)) => {
                            log::warn!("[Pinger] reply channel full, dropped {}", reply.addr);
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
            })?;

        let mut sockets = self.sockets.lock();
        sockets.push(entry);
        self.workers.lock().push(worker);
        Ok(sockets.len() - 1)
    }

    /// Send one probe from socket `index` to `raddr`.
    pub fn send(&self, index: usize, raddr: SocketAddr) -> Result<()> {
        let entry = self
            .sockets
            .lock()
            .get(index)
            .cloned()
            .ok_or_else(|| Error::InvalidParams(format!("no pinger socket {}", index)))?;
        let request_id = entry.request_id.fetch_add(1, Ordering::Relaxed);
        let probe = encode_get(entry.version, &entry.community, request_id, PROBE_OID)?;
        entry.socket.send_to(&probe, raddr)?;
        Ok(())
    }

    /// Send one probe to `raddr` from every socket in the pool.
    pub fn send_all(&self, raddr: SocketAddr) -> Result<()> {
        let count = self.sockets.lock().len();
        for index in 0..count {
            self.send(index, raddr)?;
        }
        Ok(())
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }

    /// Shared reply channel, for callers that select over several sources.
    pub fn replies(&self) -> &Receiver<PingReply> {
        &self.reply_rx
    }

    /// Pop one reply. `Ok(None)` means the timeout passed quietly;
    /// [`Error::PingerClosed`] means the pool was closed and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<PingReply>> {
        match self.reply_rx.recv_timeout(timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::PingerClosed),
        }
    }

    /// Stop every receiver thread and drop the pool's sender side.
    /// Idempotent; buffered replies stay readable until drained.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::warn!("[Pinger] receiver thread panicked");
            }
        }
        self.reply_tx.lock().take();
        self.sockets.lock().clear();
    }
}

impl Default for PingerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PingerPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("loopback addr")
    }

    /// UDP agent bouncing every datagram back to its sender. The echoed
    /// probe is itself a decodable SNMP message.
    fn spawn_echo_agent() -> SocketAddr {
        let socket = UdpSocket::bind(loopback()).expect("agent binds");
        let addr = socket.local_addr().expect("agent addr");
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            if let Ok((len, raddr)) = socket.recv_from(&mut buf) {
                let _ = socket.send_to(&buf[..len], raddr);
            }
        });
        addr
    }

    #[test]
    fn test_probe_and_reply() {
        let agent = spawn_echo_agent();
        let pool = PingerPool::new();
        let index = pool
            .listen(loopback(), SnmpVersion::V2c, "public")
            .expect("listen succeeds");
        pool.send(index, agent).expect("probe sends");

        let reply = pool
            .recv_timeout(Duration::from_secs(2))
            .expect("channel open")
            .expect("agent answered");
        assert_eq!(reply.addr, agent);
        assert_eq!(reply.version, SnmpVersion::V2c);
        assert_eq!(reply.community, "public");
        assert!(reply.error.is_none());

        pool.close();
        pool.close(); // idempotent
    }

    #[test]
    fn test_undecodable_reply_carries_error() {
        let pool = PingerPool::new();
        pool.listen(loopback(), SnmpVersion::V2c, "public")
            .expect("listen succeeds");
        let bound = pool.sockets.lock()[0]
            .socket
            .local_addr()
            .expect("bound addr");

        let garbage = UdpSocket::bind(loopback()).expect("sender binds");
        garbage.send_to(b"not snmp", bound).expect("garbage sends");

        let reply = pool
            .recv_timeout(Duration::from_secs(2))
            .expect("channel open")
            .expect("reply arrives");
        assert!(reply.error.is_some());
        pool.close();
    }

    #[test]
    fn test_send_on_unknown_socket_fails() {
        let pool = PingerPool::new();
        let err = pool
            .send(0, "127.0.0.1:1161".parse().expect("addr"))
            .expect_err("no socket 0");
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn test_recv_after_close_reports_closed() {
        let pool = PingerPool::new();
        pool.listen(loopback(), SnmpVersion::V1, "public")
            .expect("listen succeeds");
        pool.close();
        let err = pool
            .recv_timeout(Duration::from_millis(50))
            .expect_err("pool is closed");
        assert!(matches!(err, Error::PingerClosed));
    }
}
