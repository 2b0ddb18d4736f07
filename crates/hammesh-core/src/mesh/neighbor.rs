//! Peer, neighbor and repeater tables
//!
//! Every station heard is a *peer*. A peer heard directly (packet without
//! the relay marker) is also a *neighbor*, and a neighbor that addressed the
//! repeater broadcast class is also a *repeater*. The routing engine keeps
//! one [`PeerTable`] per class and ages them periodically.

use super::callsign::Callsign;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Last sighting of a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// RSSI of the last packet heard, dBm
    pub rssi: i32,
    /// Time of the last packet heard, ms
    pub timestamp: u64,
}

impl PeerEntry {
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn is_stale(&self, now: u64, ttl_ms: u64) -> bool {
        self.age(now) > ttl_ms
    }
}

/// Table of stations keyed by callsign
#[derive(Debug, Clone)]
pub struct PeerTable {
    entries: HashMap<Callsign, PeerEntry>,
    /// Entries older than this are pruned
    ttl_ms: u64,
    /// Upper bound on tracked stations
    max_entries: usize,
}

impl PeerTable {
    pub fn new(ttl_ms: u64, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms,
            max_entries,
        }
    }

    /// Refresh a station. Returns true if it was not known before.
    /// Invalid callsigns are never stored.
    pub fn update(&mut self, callsign: &Callsign, rssi: i32, now: u64) -> bool {
        if !callsign.is_valid() {
            return false;
        }
        let entry = PeerEntry {
            rssi,
            timestamp: now,
        };
        if let Some(existing) = self.entries.get_mut(callsign) {
            *existing = entry;
            return false;
        }
        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(callsign.clone(), entry);
        true
    }

    pub fn get(&self, callsign: &Callsign) -> Option<&PeerEntry> {
        self.entries.get(callsign)
    }

    pub fn contains(&self, callsign: &Callsign) -> bool {
        self.entries.contains_key(callsign)
    }

    /// Sorted copy for display
    pub fn snapshot(&self) -> BTreeMap<Callsign, PeerEntry> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Remove entries older than the TTL, returning how many went away
    pub fn prune_stale(&mut self, now: u64) -> usize {
        let ttl = self.ttl_ms;
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_stale(now, ttl));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.timestamp)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest);
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new(60 * 60 * 1000, 256) // 1 hour, 256 stations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_refresh() {
        let mut table = PeerTable::new(1000, 10);
        let a = Callsign::new("PU5EPX");

        assert!(table.update(&a, -80, 100));
        assert!(!table.update(&a, -60, 200));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(&a),
            Some(&PeerEntry {
                rssi: -60,
                timestamp: 200
            })
        );
    }

    #[test]
    fn test_invalid_callsign_not_stored() {
        let mut table = PeerTable::new(1000, 10);
        assert!(!table.update(&Callsign::new("xc"), -80, 100));
        assert!(!table.update(&Callsign::invalid(), -80, 100));
        assert!(table.is_empty());
    }

    #[test]
    fn test_prune_stale() {
        let mut table = PeerTable::new(1000, 10);
        table.update(&Callsign::new("AAAA"), -80, 0);
        table.update(&Callsign::new("BBBB"), -80, 500);

        assert_eq!(table.prune_stale(1000), 0);
        assert_eq!(table.prune_stale(1001), 1);
        assert!(!table.contains(&Callsign::new("AAAA")));
        assert!(table.contains(&Callsign::new("BBBB")));
    }

    #[test]
    fn test_eviction() {
        let mut table = PeerTable::new(10_000, 2);
        table.update(&Callsign::new("AAAA"), -80, 10);
        table.update(&Callsign::new("BBBB"), -80, 20);
        table.update(&Callsign::new("CCCC"), -80, 30);

        assert_eq!(table.len(), 2);
        assert!(!table.contains(&Callsign::new("AAAA")));
        assert!(table.contains(&Callsign::new("CCCC")));
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut table = PeerTable::default();
        table.update(&Callsign::new("ZZZZ"), -70, 1);
        table.update(&Callsign::new("AAAA"), -90, 2);
        let keys: Vec<String> = table.snapshot().keys().map(|c| c.to_string()).collect();
        assert_eq!(keys, vec!["AAAA", "ZZZZ"]);
    }
}
