//! The routing engine
//!
//! [`Network`] owns every piece of node state: the peer tables, the receive
//! log, the protocol stacks, the key cache and the task queue. All work is
//! done from tasks, so the host only has to:
//!
//! 1. call [`Network::tick`] with the current monotonic time whenever
//!    [`Network::next_deadline`] has passed
//! 2. feed every frame the radio receives to [`Network::radio_recv`]
//!
//! ```text
//!            send()                         radio_recv()
//!              │                                 │
//!        L4 tx hooks (reverse)              decode_l2
//!              │                                 │
//!              └───────► RouteTask ◄─────────────┘
//!                           │
//!        ┌──────────────────┼──────────────────────┐
//!   local dest          to me / QB,QC,QR       repeater on
//!        │                  │                      │
//!      recv()            recv()              modifiers → TxTask
//!   L4 rx → L7 → sink                        (relay jitter)
//! ```

use super::callsign::Callsign;
use super::crypto::{CipherKey, KeyCache};
use super::neighbor::{PeerEntry, PeerTable};
use super::packet::Packet;
use super::params::Params;
use super::routing::{fudge_ms, relay_delay_ms, ReceiveLog};
use super::traits::{
    AppSink, Application, MeshConfig, MeshError, MeshResult, MeshStats, Modifier,
    ProtocolContext, Radio, Reply, SwitchTarget, Transport,
};
use crate::config::{ConfigStore, NodeSettings};
use crate::scheduler::{FnTask, Reschedule, Scheduler, Task};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Packet ids roll over from this back to 1
pub const MAX_PACKET_ID: u32 = 9999;

/// Scheduler passes per tick, bounds zero-delay task chains
const MAX_PASSES_PER_TICK: usize = 32;

/// Builds the view handed to protocol handlers. A macro so the borrow stays
/// on individual fields and the protocol lists can be borrowed mutably.
macro_rules! protocol_context {
    ($net:expr) => {
        ProtocolContext {
            me: &$net.me,
            now: $net.now,
            keys: &$net.keys,
            store: &*$net.store,
        }
    };
}

/// A mesh node
pub struct Network {
    me: Callsign,
    radio: Box<dyn Radio>,
    store: Box<dyn ConfigStore>,
    sink: Box<dyn AppSink>,
    keys: KeyCache,

    transports: Vec<Box<dyn Transport>>,
    applications: Vec<Box<dyn Application>>,
    modifiers: Vec<Box<dyn Modifier>>,

    peers: PeerTable,
    neighbors: PeerTable,
    repeaters: PeerTable,
    recv_log: ReceiveLog,

    scheduler: Scheduler<Network>,
    config: MeshConfig,
    stats: MeshStats,
    repeater: bool,
    last_id: u32,
    now: u64,
    started_at: u64,
    rng: StdRng,
    stopped: bool,
}

impl Network {
    /// Create a node without protocols. Settings (callsign, repeater flag,
    /// last packet id) are read from `store`.
    pub fn new(
        mut radio: Box<dyn Radio>,
        store: Box<dyn ConfigStore>,
        sink: Box<dyn AppSink>,
        config: MeshConfig,
        now: u64,
    ) -> Self {
        let me = store.callsign();
        let repeater = store.repeater();
        let last_id = store.last_packet_id();

        radio.start_receive();
        info!("node {} up, repeater {}", me, if repeater { "on" } else { "off" });

        let mut net = Self {
            me,
            radio,
            store,
            sink,
            keys: KeyCache::new(),
            transports: Vec::new(),
            applications: Vec::new(),
            modifiers: Vec::new(),
            peers: PeerTable::new(config.neighbor_ttl_ms, 256),
            neighbors: PeerTable::new(config.neighbor_ttl_ms, 256),
            repeaters: PeerTable::new(config.neighbor_ttl_ms, 256),
            recv_log: ReceiveLog::new(config.recv_log_ttl_ms, 1024),
            scheduler: Scheduler::new(),
            config,
            stats: MeshStats::default(),
            repeater,
            last_id,
            now,
            started_at: now,
            rng: StdRng::from_entropy(),
            stopped: false,
        };
        net.schedule_housekeeping();
        net
    }

    /// Register the built-in protocols, plus the switch protocol when a
    /// target is supplied
    pub fn with_builtins(mut self, switch: Option<Box<dyn SwitchTarget>>) -> Self {
        super::protocols::install_builtins(&mut self, switch);
        self
    }

    /// Replace the random source, for reproducible simulations
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn schedule_housekeeping(&mut self) {
        let every = Duration::from_millis(self.config.neighbor_clean_interval_ms);
        self.schedule_task(
            FnTask::new("neigh", move |net: &mut Network, now: u64| {
                net.clean_neighbors(now);
                Reschedule::After(every)
            }),
            every,
        );

        let every = Duration::from_millis(self.config.recv_log_clean_interval_ms);
        self.schedule_task(
            FnTask::new("recvlog", move |net: &mut Network, now: u64| {
                net.clean_recv_log(now);
                Reschedule::After(every)
            }),
            every,
        );
    }

    pub fn add_transport(&mut self, transport: Box<dyn Transport>) {
        self.transports.push(transport);
    }

    pub fn add_application(&mut self, application: Box<dyn Application>) {
        self.applications.push(application);
    }

    pub fn add_modifier(&mut self, modifier: Box<dyn Modifier>) {
        self.modifiers.push(modifier);
    }

    /// Queue a task `offset` from now
    pub fn schedule_task<T>(&mut self, task: T, offset: Duration)
    where
        T: Task<Network> + 'static,
    {
        self.scheduler.schedule(task, offset, self.now);
    }

    /// Run due tasks.
    ///
    /// Tasks spawned with zero delay while running (routing of a freshly
    /// received packet, replies) run within the same call. Returns the
    /// number of task bodies executed.
    pub fn tick(&mut self, now: u64) -> usize {
        if self.stopped {
            return 0;
        }
        self.now = now;

        let mut ran = 0;
        for _ in 0..MAX_PASSES_PER_TICK {
            let mut queue = std::mem::take(&mut self.scheduler);
            let pass = queue.run(self, now);
            let spawned = std::mem::replace(&mut self.scheduler, queue);
            if self.stopped {
                self.scheduler.stop();
                break;
            }
            self.scheduler.absorb(spawned);
            ran += pass;

            if pass == 0 || !matches!(self.next_deadline(), Some(d) if d <= now) {
                break;
            }
        }
        ran
    }

    /// Earliest pending task deadline, for the host's wait timeout
    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduler.next_deadline()
    }

    /// Names and deadlines of queued tasks
    pub fn pending_tasks(&self) -> Vec<(String, u64)> {
        self.scheduler
            .pending()
            .map(|(name, deadline)| (name.to_string(), deadline))
            .collect()
    }

    /// Shut down: drop every queued task
    pub fn stop(&mut self) {
        self.scheduler.stop();
        self.stopped = true;
    }

    /// Originate a packet. Returns the allocated packet id.
    pub fn send(&mut self, to: Callsign, params: Params, msg: impl Into<Vec<u8>>) -> MeshResult<u32> {
        if !to.is_valid() {
            return Err(MeshError::InvalidDestination);
        }
        if !self.me.is_valid() {
            return Err(MeshError::InvalidLocalCallsign);
        }

        let id = self.next_packet_id();
        let mut packet = Packet::new(to, self.me.clone(), params, msg).with_ident(id);

        {
            let ctx = protocol_context!(self);
            for transport in self.transports.iter_mut().rev() {
                if let Some(rewritten) = transport.tx(&ctx, &packet) {
                    packet = rewritten;
                }
            }
        }

        // surface oversized frames to the caller instead of failing in a task
        packet.encode_l3()?;

        self.schedule_route(packet, true);
        Ok(id)
    }

    /// Handle a frame from the radio
    pub fn radio_recv(&mut self, frame: &[u8], rssi: i32) {
        self.stats.rx_frames += 1;
        self.stats.rx_bytes += frame.len() as u64;

        let key = self.cipher_key();
        match Packet::decode_l2(frame, rssi, key.as_ref()) {
            Ok(packet) => {
                debug!("rx good packet {}, RSSI {}", packet.signature(), rssi);
                self.schedule_route(packet, false);
            }
            Err(e) => {
                self.stats.decode_failures += 1;
                debug!("rx invalid packet, code {}: {}", e.code(), e);
            }
        }
    }

    fn schedule_route(&mut self, packet: Packet, local_origin: bool) {
        self.schedule_task(
            RouteTask {
                packet: Some(packet),
                local_origin,
            },
            Duration::ZERO,
        );
    }

    fn route(&mut self, packet: Packet, local_origin: bool) {
        if local_origin {
            if packet.to() == &self.me || packet.to().is_localhost() {
                self.recv(packet);
                return;
            }

            // recognize our own packet when a repeater sends it back
            self.recv_log
                .record(packet.signature(), packet.rssi(), self.now);

            let key = self.cipher_key();
            match packet.encode_l2(key.as_ref()) {
                Ok(frame) => {
                    debug!("tx {}", packet);
                    let delay = Duration::from_millis(self.config.local_tx_delay_ms);
                    self.schedule_task(TxTask::new(frame), delay);
                }
                Err(e) => warn!("cannot encode {}: {}", packet.signature(), e),
            }
            return;
        }

        if packet.from() == &self.me {
            self.stats.loops_dropped += 1;
            debug!("pkt loop {}", packet.signature());
            return;
        }

        let signature = packet.signature();
        if self.recv_log.contains(&signature) {
            self.stats.duplicates_dropped += 1;
            debug!("pkt dup {}", signature);
            return;
        }
        self.recv_log.record(signature, packet.rssi(), self.now);

        if packet.to() == &self.me {
            self.update_peerlist(&packet);
            self.recv(packet);
            return;
        }

        if packet.to().is_broadcast() {
            self.update_peerlist(&packet);
            self.recv(packet.clone());
        }

        if self.repeater {
            self.forward(packet);
        }
    }

    fn forward(&mut self, mut packet: Packet) {
        let already_relayed = packet.params().has("R");

        {
            let ctx = protocol_context!(self);
            for modifier in self.modifiers.iter_mut() {
                if let Some(modified) = modifier.modify(&ctx, &packet) {
                    packet = modified;
                }
            }
        }

        let key = self.cipher_key();
        let frame = match packet.encode_l2(key.as_ref()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("cannot relay {}: {}", packet.signature(), e);
                return;
            }
        };

        let delay = relay_delay_ms(
            &mut self.rng,
            &self.config,
            frame.len(),
            self.radio.bits_per_second(),
            already_relayed,
        );
        info!("relaying {} with delay {} ms", packet.signature(), delay);
        self.stats.packets_forwarded += 1;
        self.schedule_task(TxTask::new(frame), Duration::from_millis(delay));
    }

    /// Local delivery: L4 rx hooks, then L7 handlers, then the sink
    fn recv(&mut self, packet: Packet) {
        debug!("received {}", packet);
        let mut replies: Vec<Reply> = Vec::new();
        let mut abort = None;

        {
            let ctx = protocol_context!(self);
            for transport in self.transports.iter_mut() {
                let response = transport.rx(&ctx, &packet);
                replies.extend(response.reply);
                if let Some(error) = response.error {
                    abort = Some(error);
                    break;
                }
            }

            if abort.is_none() {
                for application in self.applications.iter_mut() {
                    if let Some(reply) = application.handle(&ctx, &packet) {
                        replies.push(reply);
                        break;
                    }
                }
            }
        }

        match abort {
            Some(error) => {
                self.stats.transport_aborts += 1;
                warn!("dropped {}: {}", packet.signature(), error);
            }
            None => {
                self.stats.deliveries += 1;
                self.sink.deliver(&packet);
            }
        }

        for reply in replies {
            if let Err(e) = self.send(reply.to, reply.params, reply.msg) {
                warn!("reply to {} failed: {}", packet.signature(), e);
            }
        }
    }

    fn update_peerlist(&mut self, packet: &Packet) {
        let from = packet.from();
        let rssi = packet.rssi();

        if self.peers.update(from, rssi, self.now) {
            info!("discovered peer {}", from);
        }

        // no R: heard directly from the source
        if packet.params().has("R") {
            return;
        }
        if self.neighbors.update(from, rssi, self.now) {
            info!("discovered neighbor {}", from);
        }
        if packet.to().is_repeater_broadcast() && self.repeaters.update(from, rssi, self.now) {
            info!("discovered repeater {}", from);
        }
    }

    fn clean_neighbors(&mut self, now: u64) {
        let gone = self.peers.prune_stale(now)
            + self.neighbors.prune_stale(now)
            + self.repeaters.prune_stale(now);
        if gone > 0 {
            debug!("forgot {} peer table entries", gone);
        }
    }

    fn clean_recv_log(&mut self, now: u64) {
        let gone = self.recv_log.prune_stale(now);
        if gone > 0 {
            debug!("forgot {} packet signatures", gone);
        }
    }

    fn next_packet_id(&mut self) -> u32 {
        self.last_id = if self.last_id >= MAX_PACKET_ID {
            1
        } else {
            self.last_id + 1
        };
        self.store.set_last_packet_id(self.last_id);
        self.last_id
    }

    fn cipher_key(&self) -> Option<CipherKey> {
        self.keys.cipher_key(&*self.store).cloned()
    }

    pub fn me(&self) -> &Callsign {
        &self.me
    }

    pub fn last_packet_id(&self) -> u32 {
        self.last_id
    }

    pub fn peers(&self) -> BTreeMap<Callsign, PeerEntry> {
        self.peers.snapshot()
    }

    pub fn neighbors(&self) -> BTreeMap<Callsign, PeerEntry> {
        self.neighbors.snapshot()
    }

    pub fn repeaters(&self) -> BTreeMap<Callsign, PeerEntry> {
        self.repeaters.snapshot()
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_repeater(&self) -> bool {
        self.repeater
    }

    /// Enable or disable relaying; persisted
    pub fn set_repeater(&mut self, enabled: bool) {
        self.repeater = enabled;
        self.store.set_repeater(enabled);
    }

    /// Drop cached keys and reload the callsign, after any settings change
    pub fn invalidate_keys(&mut self) {
        self.keys.invalidate();
        self.me = self.store.callsign();
    }

    pub fn store(&self) -> &dyn ConfigStore {
        &*self.store
    }

    /// Mutable settings; call [`invalidate_keys`](Self::invalidate_keys)
    /// after changing callsign or keys
    pub fn store_mut(&mut self) -> &mut dyn ConfigStore {
        &mut *self.store
    }

    /// Time of the last tick
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn uptime_ms(&self) -> u64 {
        self.now.saturating_sub(self.started_at)
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("me", &self.me)
            .field("repeater", &self.repeater)
            .field("last_id", &self.last_id)
            .field("peers", &self.peers.len())
            .field("neighbors", &self.neighbors.len())
            .field("tasks", &self.scheduler)
            .finish()
    }
}

/// Routes one packet from a fresh scheduler pass
struct RouteTask {
    packet: Option<Packet>,
    local_origin: bool,
}

impl Task<Network> for RouteTask {
    fn name(&self) -> &str {
        "fwd"
    }

    fn run(&mut self, net: &mut Network, _now: u64) -> Reschedule {
        if let Some(packet) = self.packet.take() {
            net.route(packet, self.local_origin);
        }
        Reschedule::Cancel
    }
}

/// Hands a frame to the radio, retrying while it is busy
struct TxTask {
    frame: Vec<u8>,
    attempts: u32,
}

impl TxTask {
    fn new(frame: Vec<u8>) -> Self {
        Self { frame, attempts: 0 }
    }
}

impl Task<Network> for TxTask {
    fn name(&self) -> &str {
        "tx"
    }

    fn run(&mut self, net: &mut Network, _now: u64) -> Reschedule {
        self.attempts += 1;
        if net.radio.transmit(&self.frame) {
            net.stats.tx_frames += 1;
            net.stats.tx_bytes += self.frame.len() as u64;
            return Reschedule::Cancel;
        }

        if self.attempts >= net.config.max_tx_attempts {
            net.stats.tx_drops += 1;
            warn!("radio busy, frame dropped after {} attempts", self.attempts);
            return Reschedule::Cancel;
        }

        net.stats.tx_retries += 1;
        let retry = fudge_ms(&mut net.rng, net.config.tx_retry_ms, 0.5);
        debug!("radio busy, retry in {} ms", retry);
        Reschedule::After(Duration::from_millis(retry))
    }
}
