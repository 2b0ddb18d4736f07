//! Flood routing helpers
//!
//! The mesh floods: every repeater relays every packet it has not seen
//! before, after a random delay so that repeaters hearing the same frame do
//! not collide. This module holds the pieces of that policy that do not need
//! the engine itself:
//!
//! - [`ReceiveLog`], the duplicate cache keyed by packet signature
//! - [`fudge`] and [`relay_delay_ms`], the jitter computations
//! - [`airtime_ms`], the on-air time estimate

use super::neighbor::PeerEntry;
use super::packet::Signature;
use super::traits::MeshConfig;
use rand::Rng;
use std::collections::HashMap;

/// Signatures of recently seen packets
#[derive(Debug, Clone)]
pub struct ReceiveLog {
    seen: HashMap<Signature, PeerEntry>,
    /// TTL for entries
    ttl_ms: u64,
    /// Maximum entries kept
    max_size: usize,
}

impl ReceiveLog {
    pub fn new(ttl_ms: u64, max_size: usize) -> Self {
        Self {
            seen: HashMap::new(),
            ttl_ms,
            max_size,
        }
    }

    /// Packet with this signature was seen within the TTL
    pub fn contains(&self, signature: &Signature) -> bool {
        self.seen.contains_key(signature)
    }

    /// Record a sighting
    pub fn record(&mut self, signature: Signature, rssi: i32, now: u64) {
        if self.seen.len() >= self.max_size && !self.seen.contains_key(&signature) {
            if self.prune_stale(now) == 0 {
                self.evict_oldest();
            }
        }
        self.seen.insert(
            signature,
            PeerEntry {
                rssi,
                timestamp: now,
            },
        );
    }

    pub fn get(&self, signature: &Signature) -> Option<&PeerEntry> {
        self.seen.get(signature)
    }

    /// Remove expired entries
    pub fn prune_stale(&mut self, now: u64) -> usize {
        let ttl = self.ttl_ms;
        let before = self.seen.len();
        self.seen.retain(|_, e| !e.is_stale(now, ttl));
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .seen
            .iter()
            .min_by_key(|(_, e)| e.timestamp)
            .map(|(k, _)| k.clone())
        {
            self.seen.remove(&oldest);
        }
    }
}

impl Default for ReceiveLog {
    fn default() -> Self {
        Self::new(10 * 60 * 1000, 1024) // 10 minutes, 1024 entries
    }
}

/// Uniform random value in `[avg * (1 - fraction), avg * (1 + fraction)]`,
/// never negative
pub fn fudge<R: Rng + ?Sized>(rng: &mut R, avg: f64, fraction: f64) -> f64 {
    let low = (avg * (1.0 - fraction)).max(0.0);
    let high = (avg * (1.0 + fraction)).max(low);
    if high <= low {
        return low;
    }
    rng.gen_range(low..=high)
}

/// [`fudge`] over milliseconds
pub fn fudge_ms<R: Rng + ?Sized>(rng: &mut R, avg_ms: u64, fraction: f64) -> u64 {
    fudge(rng, avg_ms as f64, fraction).round() as u64
}

/// On-air time of a frame, in milliseconds
pub fn airtime_ms(frame_len: usize, bits_per_second: u32) -> u64 {
    let bps = u64::from(bits_per_second.max(1));
    8 * frame_len as u64 * 1000 / bps
}

/// Delay before relaying a frame.
///
/// Centred on a multiple of the frame airtime. The spread doubles when the
/// packet was already relayed by another station.
pub fn relay_delay_ms<R: Rng + ?Sized>(
    rng: &mut R,
    config: &MeshConfig,
    frame_len: usize,
    bits_per_second: u32,
    already_relayed: bool,
) -> u64 {
    let centre = config.relay_airtime_factor * airtime_ms(frame_len, bits_per_second) as f64;
    let spread = if already_relayed {
        config.relay_fudge * 2.0
    } else {
        config.relay_fudge
    };
    fudge(rng, centre, spread).round() as u64
}
