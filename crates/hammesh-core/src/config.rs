//! Node configuration storage
//!
//! The persistent store (NVRAM on a real node) is an external collaborator:
//! the mesh only sees the [`ConfigStore`] key/value interface. Typed access
//! to the well-known keys goes through the [`NodeSettings`] extension trait,
//! which applies defaults and clamping in one place.
//!
//! [`MemoryStore`] is an in-memory implementation used by tests, the
//! simulator and the CLI (which persists it as JSON).

use crate::mesh::callsign::Callsign;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Well-known store keys
pub mod keys {
    pub const CALLSIGN: &str = "callsign";
    pub const LAST_ID: &str = "lastid";
    pub const REPEATER: &str = "repeater";
    pub const BEACON: &str = "beacon";
    pub const FIRST_BEACON: &str = "beacon1";
    pub const HMAC_PSK: &str = "psk";
    pub const CRYPTO_PSK: &str = "cpsk";
    pub const WIFI_SSID: &str = "ssid";
    pub const WIFI_PASSWORD: &str = "password";
}

/// Callsign used until the operator configures one
pub const FALLBACK_CALLSIGN: &str = "FIXMEE-1";

/// Beacon interval bounds (seconds)
pub const BEACON_MIN_SECS: u64 = 2;
pub const BEACON_MAX_SECS: u64 = 600;
pub const BEACON_DEFAULT_SECS: u64 = 600;

/// Average delay of the first beacon after boot (seconds)
pub const FIRST_BEACON_DEFAULT_SECS: u64 = 30;

/// Persistent key/value store
pub trait ConfigStore {
    /// Stored value, `None` if the key was never set
    fn get(&self, key: &str) -> Option<String>;

    /// Store a value
    fn set(&mut self, key: &str, value: &str);
}

/// Typed accessors for the keys the mesh uses
pub trait NodeSettings: ConfigStore {
    /// Station callsign, falling back to [`FALLBACK_CALLSIGN`]
    fn callsign(&self) -> Callsign {
        self.get(keys::CALLSIGN)
            .map(|s| Callsign::new(&s))
            .filter(Callsign::is_valid)
            .unwrap_or_else(|| Callsign::new(FALLBACK_CALLSIGN))
    }

    /// Stores the callsign; invalid ones are refused
    fn set_callsign(&mut self, callsign: &Callsign) -> bool {
        if !callsign.is_valid() {
            return false;
        }
        self.set(keys::CALLSIGN, callsign.as_str());
        true
    }

    fn last_packet_id(&self) -> u32 {
        self.get(keys::LAST_ID)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn set_last_packet_id(&mut self, id: u32) {
        self.set(keys::LAST_ID, &id.to_string());
    }

    fn repeater(&self) -> bool {
        self.get(keys::REPEATER)
            .and_then(|s| s.parse::<u32>().ok())
            .map(|r| r != 0)
            .unwrap_or(false)
    }

    fn set_repeater(&mut self, enabled: bool) {
        self.set(keys::REPEATER, if enabled { "1" } else { "0" });
    }

    /// Beacon interval; `None` when beacons are disabled (stored as 0)
    fn beacon_interval(&self) -> Option<Duration> {
        let secs = self
            .get(keys::BEACON)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(BEACON_DEFAULT_SECS);
        if secs == 0 {
            return None;
        }
        Some(Duration::from_secs(
            secs.clamp(BEACON_MIN_SECS, BEACON_MAX_SECS),
        ))
    }

    fn set_beacon_interval(&mut self, secs: u64) {
        self.set(keys::BEACON, &secs.to_string());
    }

    /// Average delay of the first beacon
    fn first_beacon_delay(&self) -> Duration {
        let secs = self
            .get(keys::FIRST_BEACON)
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&s| s > 0)
            .unwrap_or(FIRST_BEACON_DEFAULT_SECS);
        Duration::from_secs(secs.min(BEACON_MAX_SECS))
    }

    /// HMAC pre-shared key, `None` if unset or empty
    fn hmac_psk(&self) -> Option<String> {
        self.get(keys::HMAC_PSK).filter(|s| !s.is_empty())
    }

    /// Encryption pre-shared key, `None` if unset or empty
    fn crypto_psk(&self) -> Option<String> {
        self.get(keys::CRYPTO_PSK).filter(|s| !s.is_empty())
    }
}

impl<T: ConfigStore + ?Sized> NodeSettings for T {}

/// In-memory store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

impl<S: ConfigStore + ?Sized> ConfigStore for Box<S> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) {
        (**self).set(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callsign_fallback() {
        let store = MemoryStore::new();
        assert_eq!(store.callsign(), Callsign::new(FALLBACK_CALLSIGN));

        let store = MemoryStore::new().with(keys::CALLSIGN, "not valid");
        assert_eq!(store.callsign(), Callsign::new(FALLBACK_CALLSIGN));

        let mut store = MemoryStore::new();
        assert!(store.set_callsign(&Callsign::new("pu5epx-1")));
        assert!(!store.set_callsign(&Callsign::new("x")));
        assert_eq!(store.callsign(), Callsign::new("PU5EPX-1"));
    }

    #[test]
    fn test_beacon_interval_clamped() {
        assert_eq!(
            MemoryStore::new().beacon_interval(),
            Some(Duration::from_secs(BEACON_DEFAULT_SECS))
        );
        let mut store = MemoryStore::new();
        store.set_beacon_interval(1);
        assert_eq!(store.beacon_interval(), Some(Duration::from_secs(2)));
        store.set_beacon_interval(3600);
        assert_eq!(store.beacon_interval(), Some(Duration::from_secs(600)));
        store.set_beacon_interval(0);
        assert_eq!(store.beacon_interval(), None);
    }

    #[test]
    fn test_repeater_and_last_id() {
        let mut store = MemoryStore::new();
        assert!(!store.repeater());
        store.set_repeater(true);
        assert!(store.repeater());
        assert_eq!(store.last_packet_id(), 0);
        store.set_last_packet_id(9999);
        assert_eq!(store.last_packet_id(), 9999);
    }

    #[test]
    fn test_empty_psk_is_unset() {
        let store = MemoryStore::new().with(keys::HMAC_PSK, "");
        assert_eq!(store.hmac_psk(), None);
        let store = MemoryStore::new().with(keys::HMAC_PSK, "abc");
        assert_eq!(store.hmac_psk().as_deref(), Some("abc"));
    }

    #[test]
    fn test_json_roundtrip() {
        let store = MemoryStore::new()
            .with(keys::CALLSIGN, "PU5EPX")
            .with(keys::REPEATER, "1");
        let json = store.to_json().unwrap();
        assert_eq!(MemoryStore::from_json(&json).unwrap(), store);
    }
}
