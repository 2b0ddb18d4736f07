//! Core mesh traits
//!
//! The routing engine talks to the outside world through three collaborator
//! traits ([`Radio`], [`AppSink`], [`SwitchTarget`]) and is extended through
//! three protocol traits:
//!
//! - [`Transport`] (L4) sees every locally delivered and every locally sent
//!   packet, and may abort delivery
//! - [`Application`] (L7) answers packets addressed to this node
//! - [`Modifier`] rewrites packets that are about to be relayed

use super::callsign::Callsign;
use super::crypto::KeyCache;
use super::packet::{Packet, PacketError};
use super::params::Params;
use crate::config::ConfigStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the routing engine and protocol handlers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Destination callsign failed validation
    #[error("invalid destination callsign")]
    InvalidDestination,

    /// Local callsign not configured properly
    #[error("invalid local callsign")]
    InvalidLocalCallsign,

    /// Encoding or decoding failure
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// A transport protocol refused the packet
    #[error("{protocol}: {reason}")]
    Rejected {
        protocol: &'static str,
        reason: String,
    },
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Physical radio driver
pub trait Radio {
    /// Start delivering received frames; the host feeds them to
    /// `Network::radio_recv`
    fn start_receive(&mut self);

    /// Attempt to send a frame. `false` means busy, try later.
    fn transmit(&mut self, frame: &[u8]) -> bool;

    /// Effective data rate, used for airtime estimates
    fn bits_per_second(&self) -> u32;
}

/// Consumer of every locally delivered packet
pub trait AppSink {
    fn deliver(&mut self, packet: &Packet);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AppSink for NullSink {
    fn deliver(&mut self, _packet: &Packet) {}
}

/// Hardware controlled by the switch protocol
pub trait SwitchTarget {
    /// Set `target` to `value`, returning the resulting state.
    /// `None` for an unknown target.
    fn apply(&mut self, target: &str, value: &str) -> Option<String>;

    /// Current state of `target`
    fn query(&self, target: &str) -> Option<String>;
}

/// A packet to be sent in response to a received one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub to: Callsign,
    pub params: Params,
    pub msg: Vec<u8>,
}

impl Reply {
    pub fn new(to: Callsign, params: Params, msg: impl Into<Vec<u8>>) -> Self {
        Self {
            to,
            params,
            msg: msg.into(),
        }
    }
}

/// Read-only view of the node handed to protocol handlers
pub struct ProtocolContext<'a> {
    pub me: &'a Callsign,
    pub now: u64,
    pub keys: &'a KeyCache,
    pub store: &'a dyn ConfigStore,
}

/// Outcome of a transport receive hook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportRx {
    /// Packet to send back
    pub reply: Option<Reply>,
    /// Set to stop processing the packet here
    pub error: Option<MeshError>,
}

impl TransportRx {
    /// Nothing to do
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn reply(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            error: None,
        }
    }

    pub fn abort(error: MeshError) -> Self {
        Self {
            reply: None,
            error: Some(error),
        }
    }
}

/// L4 protocol, invoked for every packet
pub trait Transport {
    fn name(&self) -> &'static str;

    /// Inspect a locally delivered packet
    fn rx(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> TransportRx;

    /// Rewrite an outgoing packet; `None` leaves it unchanged
    fn tx(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Packet>;
}

/// L7 protocol, first handler that replies wins
pub trait Application {
    fn name(&self) -> &'static str;

    fn handle(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Reply>;
}

/// Rewrites packets before they are relayed
pub trait Modifier {
    fn name(&self) -> &'static str;

    /// `None` leaves the packet unchanged
    fn modify(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Packet>;
}

/// Counters kept by the routing engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    /// Frames handed to the radio
    pub tx_frames: u64,
    pub tx_bytes: u64,
    /// Frames received from the radio
    pub rx_frames: u64,
    pub rx_bytes: u64,
    /// Frames that failed L2/L3 decoding
    pub decode_failures: u64,
    /// Our own packets heard back
    pub loops_dropped: u64,
    pub duplicates_dropped: u64,
    /// Packets relayed for other stations
    pub packets_forwarded: u64,
    /// Packets delivered to the application sink
    pub deliveries: u64,
    /// Packets stopped by a transport protocol
    pub transport_aborts: u64,
    /// Transmit attempts that found the radio busy
    pub tx_retries: u64,
    /// Frames given up after repeated busy radio
    pub tx_drops: u64,
}

/// Timing of the routing engine (all values in milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Peer/neighbor/repeater entries expire after this
    pub neighbor_ttl_ms: u64,
    pub neighbor_clean_interval_ms: u64,
    /// Receive log entries expire after this
    pub recv_log_ttl_ms: u64,
    pub recv_log_clean_interval_ms: u64,
    /// Delay before sending a locally originated packet
    pub local_tx_delay_ms: u64,
    /// Average backoff when the radio is busy
    pub tx_retry_ms: u64,
    /// Transmit attempts before a frame is dropped
    pub max_tx_attempts: u32,
    /// Relay delay centre, in units of frame airtime
    pub relay_airtime_factor: f64,
    /// Relay delay spread (fraction of centre)
    pub relay_fudge: f64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            neighbor_ttl_ms: 60 * 60 * 1000, // 1 hour
            neighbor_clean_interval_ms: 60 * 1000,
            recv_log_ttl_ms: 10 * 60 * 1000, // 10 minutes
            recv_log_clean_interval_ms: 60 * 1000,
            local_tx_delay_ms: 50,
            tx_retry_ms: 1000,
            max_tx_attempts: 3,
            relay_airtime_factor: 2.5,
            relay_fudge: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_error_display() {
        let err = MeshError::Rejected {
            protocol: "hmac",
            reason: "missing HMAC".into(),
        };
        assert_eq!(err.to_string(), "hmac: missing HMAC");

        let err = MeshError::from(PacketError::FrameTooLong(200));
        assert!(err.to_string().contains("200"));
    }

    #[test]
    fn test_mesh_config_default() {
        let config = MeshConfig::default();
        assert_eq!(config.neighbor_ttl_ms, 3_600_000);
        assert_eq!(config.recv_log_ttl_ms, 600_000);
        assert_eq!(config.max_tx_attempts, 3);
    }

    #[test]
    fn test_transport_rx_constructors() {
        assert_eq!(TransportRx::pass(), TransportRx::default());
        let r = TransportRx::abort(MeshError::InvalidDestination);
        assert!(r.reply.is_none());
        assert!(r.error.is_some());
    }
}
