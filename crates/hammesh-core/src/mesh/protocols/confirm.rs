//! Confirmed delivery (`C` param)
//!
//! A packet carrying `C` asks the destination for a confirmation. The reply
//! carries `CO` and is never confirmed itself.

use super::naked;
use crate::mesh::packet::Packet;
use crate::mesh::traits::{ProtocolContext, Reply, Transport, TransportRx};

#[derive(Debug, Default, Clone, Copy)]
pub struct ConfirmTransport;

impl Transport for ConfirmTransport {
    fn name(&self) -> &'static str {
        "confirm"
    }

    fn rx(&mut self, _ctx: &ProtocolContext<'_>, packet: &Packet) -> TransportRx {
        let params = packet.params();
        if !params.has("C") || params.has("CO") || packet.to().is_broadcast() {
            return TransportRx::pass();
        }

        TransportRx::reply(Reply::new(
            packet.from().clone(),
            naked("CO"),
            format!("confirm #{}", packet.ident()),
        ))
    }

    fn tx(&mut self, _ctx: &ProtocolContext<'_>, _packet: &Packet) -> Option<Packet> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::mesh::callsign::Callsign;
    use crate::mesh::crypto::KeyCache;

    fn rx(s: &str) -> TransportRx {
        let store = MemoryStore::new();
        let cache = KeyCache::new();
        let me = Callsign::new("PU5EPX");
        let ctx = ProtocolContext {
            me: &me,
            now: 0,
            keys: &cache,
            store: &store,
        };
        ConfirmTransport.rx(&ctx, &Packet::decode_l3(s.as_bytes(), 0).unwrap())
    }

    #[test]
    fn test_confirm_reply() {
        let reply = rx("PU5EPX<AAAA:42,C hello").reply.unwrap();
        assert_eq!(reply.to, Callsign::new("AAAA"));
        assert!(reply.params.is_naked("CO"));
        assert_eq!(reply.msg, b"confirm #42");
    }

    #[test]
    fn test_no_confirm() {
        assert_eq!(rx("PU5EPX<AAAA:42 hello"), TransportRx::pass());
        assert_eq!(rx("PU5EPX<AAAA:42,C,CO hello"), TransportRx::pass());
        assert_eq!(rx("QC<AAAA:42,C hello"), TransportRx::pass());
        assert_eq!(rx("QB<AAAA:42,C hello"), TransportRx::pass());
    }
}
