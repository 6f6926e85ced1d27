//! In-memory fault-injecting network for testing the reliability engine
//! without real sockets: configurable packet loss, duplication, reordering
//! delay, and one-way latency, all driven by a seeded PRNG so runs are
//! reproducible.
//!
//! A [`SimulatedNetwork`] is a shared switchboard; [`SimulatedTransport`]
//! handles, one per simulated peer, are the [`Transport`] endpoints handed
//! to session/server/client code under test.

use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Fault-injection parameters for a [`SimulatedNetwork`].
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability in `[0.0, 1.0]` that an in-flight packet is dropped.
    pub loss_probability: f64,
    /// Probability in `[0.0, 1.0]` that an in-flight packet is delivered twice.
    pub duplicate_probability: f64,
    /// Fixed one-way delay applied to every delivered packet.
    pub base_latency: Duration,
    /// Extra random delay added on top of `base_latency`, uniformly in `[0, jitter)`.
    pub jitter: Duration,
    /// RNG seed, for reproducible fault injection across test runs.
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            loss_probability: 0.0,
            duplicate_probability: 0.0,
            base_latency: Duration::ZERO,
            jitter: Duration::ZERO,
            seed: 0,
        }
    }
}

struct Inbox {
    queue: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    notify: Notify,
}

impl Inbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, from: SocketAddr, data: Vec<u8>) {
        self.queue.lock().expect("inbox mutex poisoned").push_back((from, data));
        self.notify.notify_one();
    }
}

/// Shared medium connecting [`SimulatedTransport`] endpoints.
///
/// Each packet handed to [`SimulatedNetwork::enqueue`] is independently
/// subject to the configured [`FaultConfig`] — dropped, duplicated, and/or
/// delayed — then delivered to the destination's inbox on its own spawned
/// delivery task, so packets sent back-to-back can arrive out of order.
pub struct SimulatedNetwork {
    faults: FaultConfig,
    rng: Mutex<StdRng>,
    inboxes: Mutex<HashMap<SocketAddr, Arc<Inbox>>>,
    next_port: AtomicU16,
}

impl SimulatedNetwork {
    /// Build a new network with the given fault parameters.
    #[must_use]
    pub fn new(faults: FaultConfig) -> Arc<Self> {
        let rng = StdRng::seed_from_u64(faults.seed);
        Arc::new(Self {
            faults,
            rng: Mutex::new(rng),
            inboxes: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(1),
        })
    }

    /// Build a network with no fault injection: every packet is delivered
    /// exactly once, immediately.
    #[must_use]
    pub fn ideal() -> Arc<Self> {
        Self::new(FaultConfig::default())
    }

    /// Bind a new simulated endpoint on `127.0.0.1` with an auto-assigned port.
    pub fn bind(self: &Arc<Self>) -> Arc<SimulatedTransport> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        self.bind_addr(addr)
    }

    /// Bind a new simulated endpoint at a specific address.
    pub fn bind_addr(self: &Arc<Self>, addr: SocketAddr) -> Arc<SimulatedTransport> {
        let inbox = Arc::new(Inbox::new());
        self.inboxes
            .lock()
            .expect("inbox table mutex poisoned")
            .insert(addr, inbox.clone());
        Arc::new(SimulatedTransport {
            network: self.clone(),
            local_addr: addr,
            inbox,
            closed: AtomicBool::new(false),
            stats: Mutex::new(TransportStats::default()),
        })
    }

    fn enqueue(self: &Arc<Self>, from: SocketAddr, to: SocketAddr, data: Vec<u8>) {
        let copies = {
            let mut rng = self.rng.lock().expect("network rng mutex poisoned");
            if rng.gen_bool(self.faults.loss_probability) {
                return;
            }
            if rng.gen_bool(self.faults.duplicate_probability) {
                2
            } else {
                1
            }
        };

        for _ in 0..copies {
            let delay = {
                let mut rng = self.rng.lock().expect("network rng mutex poisoned");
                let jitter = if self.faults.jitter.is_zero() {
                    Duration::ZERO
                } else {
                    Duration::from_nanos(rng.gen_range(0..self.faults.jitter.as_nanos() as u64))
                };
                self.faults.base_latency + jitter
            };

            let network = self.clone();
            let payload = data.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let inbox = network.inboxes.lock().expect("inbox table mutex poisoned").get(&to).cloned();
                if let Some(inbox) = inbox {
                    inbox.push(from, payload);
                }
            });
        }
    }
}

/// One simulated peer's [`Transport`] endpoint.
pub struct SimulatedTransport {
    network: Arc<SimulatedNetwork>,
    local_addr: SocketAddr,
    inbox: Arc<Inbox>,
    closed: AtomicBool,
    stats: Mutex<TransportStats>,
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.network.enqueue(self.local_addr, addr, buf.to_vec());
        self.stats.lock().expect("stats mutex poisoned").record_send(buf.len());
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let next = self.inbox.queue.lock().expect("inbox mutex poisoned").pop_front();
            if let Some((from, data)) = next {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                self.stats.lock().expect("stats mutex poisoned").record_recv(n);
                return Ok((n, from));
            }
            self.inbox.notify.notified().await;
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        self.inbox.notify.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().expect("stats mutex poisoned").clone()
    }
}
