//! Route discovery (`RREQ` / `RRSP`)
//!
//! A route request travels by flooding. Every repeater appends
//! `>CALLSIGN rssi` to the message, the destination appends `|CALLSIGN rssi`
//! and answers with `RRSP`, which collects the return path the same way.
//! The final message reads like `hi>PY5AAA -70|PU5EPX -82>PY5AAA -65`.

use super::naked;
use crate::mesh::packet::Packet;
use crate::mesh::traits::{Application, Modifier, ProtocolContext, Reply};

fn is_route_traffic(packet: &Packet) -> bool {
    packet.params().has("RREQ") || packet.params().has("RRSP")
}

fn append_hop(packet: &Packet, separator: char, ctx: &ProtocolContext<'_>) -> Vec<u8> {
    let mut msg = packet.msg().to_vec();
    msg.extend_from_slice(format!("{}{} {}", separator, ctx.me, packet.rssi()).as_bytes());
    msg
}

/// Answers route requests addressed to this node
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteRequestApp;

impl Application for RouteRequestApp {
    fn name(&self) -> &'static str {
        "rreq"
    }

    fn handle(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Reply> {
        if packet.to().is_broadcast() || !packet.params().has("RREQ") {
            return None;
        }
        Some(Reply::new(
            packet.from().clone(),
            naked("RRSP"),
            append_hop(packet, '|', ctx),
        ))
    }
}

/// Adds the relaying station to route requests and responses
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteRequestModifier;

impl Modifier for RouteRequestModifier {
    fn name(&self) -> &'static str {
        "rreq"
    }

    fn modify(&mut self, ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Packet> {
        if packet.to().is_q() || !is_route_traffic(packet) {
            return None;
        }
        Some(packet.change_msg(append_hop(packet, '>', ctx)))
    }
}
