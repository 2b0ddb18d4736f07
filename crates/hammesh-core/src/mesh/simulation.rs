//! Multi-node mesh simulation
//!
//! Runs several [`Network`]s against a shared virtual channel and a virtual
//! millisecond clock, so routing can be exercised without radios:
//!
//! - links come from a [`Topology`] (chain, full mesh or explicit adjacency)
//! - every node's [`SimRadio`] queues its frames on the channel
//! - [`MeshSimulator::step`] hands queued frames to the linked nodes, then
//!   ticks every node
//! - a [`RecordingSink`] per node keeps what was delivered locally
//!
//! ## Example
//!
//! ```
//! use hammesh_core::mesh::params::Params;
//! use hammesh_core::mesh::simulation::{MeshSimulator, SimConfig, Topology};
//!
//! let config = SimConfig::default()
//!     .with_node_count(3)
//!     .with_topology(Topology::Chain)
//!     .with_repeaters(true);
//! let mut sim = MeshSimulator::new(config);
//!
//! let to = sim.callsign(2).clone();
//! sim.send(0, to, Params::new(), "hello").unwrap();
//! sim.run(30_000);
//!
//! assert_eq!(sim.deliveries(2).len(), 1);
//! ```

use super::callsign::Callsign;
use super::network::Network;
use super::packet::Packet;
use super::params::Params;
use super::protocols::MemorySwitch;
use super::traits::{AppSink, MeshConfig, MeshResult, MeshStats, Radio, SwitchTarget};
use crate::config::{keys, MemoryStore};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, trace};

/// Which nodes hear which
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Node `i` hears `i - 1` and `i + 1`
    Chain,
    /// Every node hears every other node
    FullMesh,
    /// `links[i]` lists the nodes that hear node `i`
    Custom(Vec<Vec<usize>>),
}

impl Topology {
    /// Adjacency list for `n` nodes
    pub fn links(&self, n: usize) -> Vec<Vec<usize>> {
        match self {
            Topology::Chain => (0..n)
                .map(|i| {
                    let mut l = Vec::new();
                    if i > 0 {
                        l.push(i - 1);
                    }
                    if i + 1 < n {
                        l.push(i + 1);
                    }
                    l
                })
                .collect(),
            Topology::FullMesh => (0..n)
                .map(|i| (0..n).filter(|&j| j != i).collect())
                .collect(),
            Topology::Custom(links) => (0..n)
                .map(|i| {
                    links
                        .get(i)
                        .map(|l| l.iter().copied().filter(|&j| j < n && j != i).collect())
                        .unwrap_or_default()
                })
                .collect(),
        }
    }
}

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of nodes in the simulation
    pub node_count: usize,
    pub topology: Topology,
    /// RSSI reported for every received frame (dBm)
    pub rssi_dbm: i32,
    /// Radio data rate, drives relay jitter
    pub bits_per_second: u32,
    /// Clock advance per step in [`MeshSimulator::run`]
    pub step_ms: u64,
    /// Random seed; node `i` uses `seed + i`
    pub seed: u64,
    /// Every node relays
    pub repeaters: bool,
    /// Periodic beacons on
    pub beacons: bool,
    pub hmac_psk: Option<String>,
    pub crypto_psk: Option<String>,
    /// Targets of an in-memory switch bank on every node; empty disables
    /// the switch protocol
    pub switch_targets: Vec<String>,
    pub mesh: MeshConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 2,
            topology: Topology::FullMesh,
            rssi_dbm: -80,
            bits_per_second: 1200,
            step_ms: 10,
            seed: 42,
            repeaters: false,
            beacons: false,
            hmac_psk: None,
            crypto_psk: None,
            switch_targets: Vec::new(),
            mesh: MeshConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_rssi(mut self, rssi_dbm: i32) -> Self {
        self.rssi_dbm = rssi_dbm;
        self
    }

    pub fn with_repeaters(mut self, repeaters: bool) -> Self {
        self.repeaters = repeaters;
        self
    }

    pub fn with_beacons(mut self, beacons: bool) -> Self {
        self.beacons = beacons;
        self
    }

    pub fn with_hmac_psk(mut self, psk: &str) -> Self {
        self.hmac_psk = Some(psk.to_string());
        self
    }

    pub fn with_crypto_psk(mut self, psk: &str) -> Self {
        self.crypto_psk = Some(psk.to_string());
        self
    }

    pub fn with_switch_targets<'a>(mut self, targets: impl IntoIterator<Item = &'a str>) -> Self {
        self.switch_targets = targets.into_iter().map(str::to_string).collect();
        self
    }
}

/// A frame on the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirFrame {
    /// Index of the transmitting node
    pub from: usize,
    /// Virtual time of transmission
    pub at: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct Channel {
    now: u64,
    /// Frames not yet delivered
    queue: VecDeque<AirFrame>,
    /// Every frame ever sent
    history: Vec<AirFrame>,
}

/// Radio that puts frames on the shared simulated channel
pub struct SimRadio {
    index: usize,
    bits_per_second: u32,
    channel: Rc<RefCell<Channel>>,
}

impl Radio for SimRadio {
    fn start_receive(&mut self) {}

    fn transmit(&mut self, frame: &[u8]) -> bool {
        let mut channel = self.channel.borrow_mut();
        let air = AirFrame {
            from: self.index,
            at: channel.now,
            bytes: frame.to_vec(),
        };
        trace!("node {} on air, {} bytes", self.index, frame.len());
        channel.queue.push_back(air.clone());
        channel.history.push(air);
        true
    }

    fn bits_per_second(&self) -> u32 {
        self.bits_per_second
    }
}

/// Sink keeping every delivered packet
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    packets: Rc<RefCell<Vec<Packet>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.packets.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.packets.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.borrow().is_empty()
    }
}

impl AppSink for RecordingSink {
    fn deliver(&mut self, packet: &Packet) {
        self.packets.borrow_mut().push(packet.clone());
    }
}

/// Simulation statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    /// Virtual time elapsed (ms)
    pub elapsed_ms: u64,
    /// Frames put on the air
    pub frames_transmitted: u64,
    /// Frame receptions (one per frame per listening node)
    pub frames_received: u64,
    /// Packets delivered to node sinks
    pub deliveries: u64,
    pub per_node: Vec<NodeStats>,
}

/// Per-node statistics
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub callsign: String,
    pub deliveries: usize,
    pub neighbors: usize,
    pub mesh: MeshStats,
}

struct SimNode {
    net: Network,
    sink: RecordingSink,
    switch: Option<MemorySwitch>,
}

/// Multi-node mesh network simulator
pub struct MeshSimulator {
    config: SimConfig,
    nodes: Vec<SimNode>,
    links: Vec<Vec<usize>>,
    channel: Rc<RefCell<Channel>>,
    now: u64,
    frames_received: u64,
}

/// Callsign of node `i`
pub fn sim_callsign(i: usize) -> Callsign {
    Callsign::new(&format!("SIM{:03}", i + 1))
}

impl MeshSimulator {
    pub fn new(config: SimConfig) -> Self {
        let channel = Rc::new(RefCell::new(Channel::default()));
        let links = config.topology.links(config.node_count);

        let nodes = (0..config.node_count)
            .map(|i| Self::build_node(&config, i, channel.clone()))
            .collect();
        debug!("simulating {} nodes, links {:?}", config.node_count, links);

        Self {
            config,
            nodes,
            links,
            channel,
            now: 0,
            frames_received: 0,
        }
    }

    fn build_node(config: &SimConfig, i: usize, channel: Rc<RefCell<Channel>>) -> SimNode {
        let mut store = MemoryStore::new()
            .with(keys::CALLSIGN, sim_callsign(i).as_str())
            .with(keys::REPEATER, if config.repeaters { "1" } else { "0" });
        if !config.beacons {
            store = store.with(keys::BEACON, "0");
        }
        if let Some(psk) = &config.hmac_psk {
            store = store.with(keys::HMAC_PSK, psk);
        }
        if let Some(psk) = &config.crypto_psk {
            store = store.with(keys::CRYPTO_PSK, psk);
        }

        let radio = SimRadio {
            index: i,
            bits_per_second: config.bits_per_second,
            channel,
        };
        let sink = RecordingSink::new();
        let switch = (!config.switch_targets.is_empty())
            .then(|| MemorySwitch::new(config.switch_targets.iter().map(String::as_str)));

        let net = Network::new(
            Box::new(radio),
            Box::new(store),
            Box::new(sink.clone()),
            config.mesh.clone(),
            0,
        )
        .with_rng_seed(config.seed.wrapping_add(i as u64))
        .with_builtins(
            switch
                .clone()
                .map(|s| Box::new(s) as Box<dyn SwitchTarget>),
        );

        SimNode { net, sink, switch }
    }

    /// Advance the clock by `dt_ms`: deliver frames sent so far, then tick
    /// every node
    pub fn step(&mut self, dt_ms: u64) {
        self.now += dt_ms;

        let frames: Vec<AirFrame> = {
            let mut channel = self.channel.borrow_mut();
            channel.now = self.now;
            channel.queue.drain(..).collect()
        };
        for frame in frames {
            for &to in &self.links[frame.from] {
                self.nodes[to].net.radio_recv(&frame.bytes, self.config.rssi_dbm);
                self.frames_received += 1;
            }
        }

        for node in &mut self.nodes {
            node.net.tick(self.now);
        }
    }

    /// Step in `step_ms` increments for `duration_ms`
    pub fn run(&mut self, duration_ms: u64) {
        let end = self.now + duration_ms;
        while self.now < end {
            self.step(self.config.step_ms.min(end - self.now));
        }
    }

    /// Step until `condition` holds or `max_ms` elapsed. Returns whether
    /// the condition was met.
    pub fn run_until<F>(&mut self, max_ms: u64, condition: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let end = self.now + max_ms;
        while self.now < end {
            self.step(self.config.step_ms.min(end - self.now));
            if condition(self) {
                return true;
            }
        }
        false
    }

    /// Originate a packet from node `from`
    pub fn send(
        &mut self,
        from: usize,
        to: Callsign,
        params: Params,
        msg: impl Into<Vec<u8>>,
    ) -> MeshResult<u32> {
        self.nodes[from].net.send(to, params, msg)
    }

    /// Put a raw frame on the air as if node `from` had sent it
    pub fn inject(&mut self, from: usize, bytes: Vec<u8>) {
        let mut channel = self.channel.borrow_mut();
        let air = AirFrame {
            from,
            at: channel.now,
            bytes,
        };
        channel.queue.push_back(air.clone());
        channel.history.push(air);
    }

    pub fn node(&self, i: usize) -> &Network {
        &self.nodes[i].net
    }

    pub fn node_mut(&mut self, i: usize) -> &mut Network {
        &mut self.nodes[i].net
    }

    pub fn callsign(&self, i: usize) -> &Callsign {
        self.nodes[i].net.me()
    }

    /// Index of the node using `callsign`
    pub fn index_of(&self, callsign: &Callsign) -> Option<usize> {
        self.nodes.iter().position(|n| n.net.me() == callsign)
    }

    /// Packets delivered locally at node `i`
    pub fn deliveries(&self, i: usize) -> Vec<Packet> {
        self.nodes[i].sink.packets()
    }

    pub fn switch(&self, i: usize) -> Option<&MemorySwitch> {
        self.nodes[i].switch.as_ref()
    }

    /// Every frame sent so far
    pub fn air_log(&self) -> Vec<AirFrame> {
        self.channel.borrow().history.clone()
    }

    pub fn links(&self, i: usize) -> &[usize] {
        &self.links[i]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn stats(&self) -> SimStats {
        let per_node: Vec<NodeStats> = self
            .nodes
            .iter()
            .map(|n| NodeStats {
                callsign: n.net.me().to_string(),
                deliveries: n.sink.len(),
                neighbors: n.net.neighbors().len(),
                mesh: n.net.stats().clone(),
            })
            .collect();

        SimStats {
            elapsed_ms: self.now,
            frames_transmitted: self.channel.borrow().history.len() as u64,
            frames_received: self.frames_received,
            deliveries: per_node.iter().map(|n| n.deliveries as u64).sum(),
            per_node,
        }
    }
}
