//! Relay marker
//!
//! Every relayed packet gets a naked `R`, so receivers can tell neighbors
//! (heard directly) from stations heard through a repeater.

use crate::mesh::packet::Packet;
use crate::mesh::traits::{Modifier, ProtocolContext};

#[derive(Debug, Default, Clone, Copy)]
pub struct RelayMarker;

impl Modifier for RelayMarker {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn modify(&mut self, _ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Packet> {
        if packet.params().is_naked("R") {
            return None;
        }
        let mut params = packet.params().clone();
        params.put_naked("R");
        Some(packet.change_params(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::mesh::callsign::Callsign;
    use crate::mesh::crypto::KeyCache;

    #[test]
    fn test_marks_once() {
        let store = MemoryStore::new();
        let cache = KeyCache::new();
        let me = Callsign::new("PU5EPX");
        let ctx = ProtocolContext {
            me: &me,
            now: 0,
            keys: &cache,
            store: &store,
        };

        let p = Packet::decode_l3(b"QB<AAAA:3,H=0a1b2c3d4e5f hi", 0).unwrap();
        let marked = RelayMarker.modify(&ctx, &p).unwrap();
        assert!(marked.params().is_naked("R"));
        assert_eq!(marked.params().get("H"), Some("0a1b2c3d4e5f"));
        assert_eq!(marked.ident(), 3);
        assert_eq!(marked.msg(), b"hi");

        assert!(RelayMarker.modify(&ctx, &marked).is_none());
    }
}
