//! Ping/pong
//!
//! Broadcast pings are ignored: every station in range would answer at the
//! same time and the replies would collide.

use super::naked;
use crate::mesh::packet::Packet;
use crate::mesh::traits::{Application, ProtocolContext, Reply};

#[derive(Debug, Default, Clone, Copy)]
pub struct PingApp;

impl Application for PingApp {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn handle(&mut self, _ctx: &ProtocolContext<'_>, packet: &Packet) -> Option<Reply> {
        let to = packet.to();
        if (to.is_q() && !to.is_localhost()) || !packet.params().has("PING") {
            return None;
        }
        Some(Reply::new(
            packet.from().clone(),
            naked("PONG"),
            packet.msg().to_vec(),
        ))
    }
}
