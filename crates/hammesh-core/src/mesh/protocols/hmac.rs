//! Packet authentication
//!
//! Signs every outgoing packet with a truncated HMAC in param `H` and
//! refuses received packets whose tag is missing, malformed or wrong. Route
//! requests and responses are exempt: relays append to their message, which
//! would break the tag. Without a configured key the protocol is inert.

use crate::mesh::crypto::{hmac_tag, verify_hmac};
use crate::mesh::packet::Packet;
use crate::mesh::params::Params;
use crate::mesh::traits::{MeshError, ProtocolContext, Transport, TransportRx};
use tracing::trace;

pub const PARAM: &str = "H";

/// HMAC signer/verifier
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacTransport;

fn exempt(params: &Params) -> bool {
    params.has("RREQ") || params.has("RRSP")
}

fn reject(reason: impl Into<String>) -> TransportRx {
    TransportRx::abort(MeshError::Rejected {
        protocol: "hmac",
        reason: reason.into(),
    })
}

impl Transport for HmacTransport {
    fn name(&self) -> &'static str {
        "hmac"
    }

    fn rx(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> TransportRx {
        let Some(key) = ctx.keys.hmac_key_for(ctx.store, packet.from()) else {
            return TransportRx::pass();
        };
        if exempt(packet.params()) {
            return TransportRx::pass();
        }
        let Some(tag) = packet.params().get(PARAM) else {
            return reject("packet without HMAC");
        };

        match verify_hmac(
            key,
            packet.to(),
            packet.from(),
            packet.ident(),
            packet.msg(),
            tag,
        ) {
            Ok(()) => TransportRx::pass(),
            Err(e) => reject(e.to_string()),
        }
    }

    fn tx(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Packet> {
        let key = ctx.keys.hmac_key_for(ctx.store, packet.from())?;
        if exempt(packet.params()) {
            return None;
        }

        let tag = hmac_tag(
            key,
            packet.to(),
            packet.from(),
            packet.ident(),
            packet.msg(),
        )
        .ok()?;
        trace!("signing {} with {}", packet.signature(), tag);

        let mut params = packet.params().clone();
        params.put(PARAM, tag);
        Some(packet.change_params(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, ConfigStore, MemoryStore};
    use crate::mesh::callsign::Callsign;
    use crate::mesh::crypto::KeyCache;

    fn with_ctx<R>(psk: Option<&str>, f: impl FnOnce(&ProtocolContext<'_>) -> R) -> R {
        let mut store = MemoryStore::new();
        if let Some(psk) = psk {
            store.set(keys::HMAC_PSK, psk);
        }
        let cache = KeyCache::new();
        let me = Callsign::new("PU5EPX");
        let ctx = ProtocolContext {
            me: &me,
            now: 0,
            keys: &cache,
            store: &store,
        };
        f(&ctx)
    }

    fn packet(s: &str) -> Packet {
        Packet::decode_l3(s.as_bytes(), 0).unwrap()
    }

    #[test]
    fn test_sign_then_verify() {
        with_ctx(Some("secret"), |ctx| {
            let mut hmac = HmacTransport;
            let signed = hmac.tx(ctx, &packet("PU5EPX<AAAA:12 hello")).unwrap();
            assert_eq!(signed.params().get("H").map(str::len), Some(12));
            assert_eq!(hmac.rx(ctx, &signed), TransportRx::pass());

            let tampered = signed.change_msg("hellp");
            assert!(hmac.rx(ctx, &tampered).error.is_some());
        });
    }

    #[test]
    fn test_missing_and_malformed() {
        with_ctx(Some("secret"), |ctx| {
            let mut hmac = HmacTransport;
            let rx = hmac.rx(ctx, &packet("PU5EPX<AAAA:12 hello"));
            assert_eq!(
                rx.error,
                Some(MeshError::Rejected {
                    protocol: "hmac",
                    reason: "packet without HMAC".into()
                })
            );
            assert!(hmac
                .rx(ctx, &packet("PU5EPX<AAAA:12,H=abc hello"))
                .error
                .is_some());
            assert!(hmac
                .rx(ctx, &packet("PU5EPX<AAAA:12,H hello"))
                .error
                .is_some());
        });
    }

    #[test]
    fn test_route_requests_exempt() {
        with_ctx(Some("secret"), |ctx| {
            let mut hmac = HmacTransport;
            let p = packet("PU5EPX<AAAA:12,RREQ x");
            assert!(hmac.tx(ctx, &p).is_none());
            assert_eq!(hmac.rx(ctx, &p), TransportRx::pass());
        });
    }

    #[test]
    fn test_inert_without_key() {
        with_ctx(None, |ctx| {
            let mut hmac = HmacTransport;
            let p = packet("PU5EPX<AAAA:12 hello");
            assert!(hmac.tx(ctx, &p).is_none());
            assert_eq!(hmac.rx(ctx, &p), TransportRx::pass());
        });
    }
}
